//! Page sweeping
//!
//! Sweeping one page walks its headers in address order:
//! - marked objects are unmarked and survive
//! - dead objects and existing free blocks merge into gaps
//! - each gap becomes one zeroed free block with its bitmap bit set
//!
//! On the mutator, dead objects are finalized right away. Background
//! sweeping cannot run finalizers, so gaps holding objects with a finalizer
//! are recorded as unfinalized and turned into free blocks by the mutator
//! afterwards ([`SweptPageState::finalize`]).

use crate::heap::free_list::{Block, FreeList};
use crate::heap::BasePage;
use crate::object::gc_info::GcInfoTable;
use crate::object::header::{HeapObjectHeader, HEADER_SIZE};
use crate::util::Address;
use std::sync::Arc;

/// Where the sweep runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// On the mutator: finalize dead objects immediately
    Inline,
    /// On a background thread: leave finalization to the mutator
    Deferred,
}

/// Result of sweeping one page
pub struct SweptPageState {
    pub page: Arc<BasePage>,
    /// No object survived
    pub is_empty: bool,
    /// Free blocks ready for allocation
    pub cached_free_list: FreeList,
    /// Gaps that still hold unfinalized objects
    pub unfinalized_free_list: Vec<Block>,
    /// Headers of dead objects waiting for their finalizer
    pub unfinalized_objects: Vec<Address>,
    pub largest_new_free_list_entry: usize,
    /// Bytes of dead objects reclaimed
    pub swept_unmarked_size: usize,
    pub objects_finalized: usize,
}

impl SweptPageState {
    fn new(page: Arc<BasePage>) -> Self {
        Self {
            page,
            is_empty: false,
            cached_free_list: FreeList::new(),
            unfinalized_free_list: Vec::new(),
            unfinalized_objects: Vec::new(),
            largest_new_free_list_entry: 0,
            swept_unmarked_size: 0,
            objects_finalized: 0,
        }
    }

    /// Whether the page was swept in the background and needs the mutator
    pub fn needs_finalization(&self) -> bool {
        !self.unfinalized_objects.is_empty() || !self.unfinalized_free_list.is_empty()
    }

    /// Run pending finalizers and turn their gaps into free blocks
    ///
    /// Must run on the mutator.
    pub fn finalize(&mut self, gc_info: &GcInfoTable) {
        for address in self.unfinalized_objects.drain(..) {
            // SAFETY: recorded headers are dead objects on a live page.
            let header = unsafe { HeapObjectHeader::at(address) };
            // SAFETY: the object is unreachable and finalized exactly once.
            if unsafe { gc_info.finalize(header.gc_info_index(), header.payload()) } {
                self.objects_finalized += 1;
            }
        }
        if self.is_empty {
            self.unfinalized_free_list.clear();
            return;
        }
        let bitmap = self.page.object_start_bitmap();
        for block in self.unfinalized_free_list.drain(..) {
            // SAFETY: the gap holds only dead, finalized objects.
            unsafe { std::ptr::write_bytes(block.address as *mut u8, 0, block.size) };
            bitmap.clear_range(block.address, block.address + block.size);
            bitmap.set_bit(block.address);
            // SAFETY: the range was just zeroed and belongs to this page.
            unsafe { self.cached_free_list.add(block.address, block.size) };
            self.largest_new_free_list_entry = self.largest_new_free_list_entry.max(block.size);
        }
    }
}

impl std::fmt::Debug for SweptPageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweptPageState")
            .field("page", &self.page.id())
            .field("is_empty", &self.is_empty)
            .field("free", &self.cached_free_list.size())
            .field("unfinalized", &self.unfinalized_objects.len())
            .finish()
    }
}

pub fn sweep_page(page: Arc<BasePage>, gc_info: &GcInfoTable, mode: SweepMode) -> SweptPageState {
    if page.is_large() {
        sweep_large_page(page, gc_info, mode)
    } else {
        sweep_normal_page(page, gc_info, mode)
    }
}

/// Handle one dead object; returns true if it still needs its finalizer
fn reclaim_dead_object(
    header: &HeapObjectHeader,
    gc_info: &GcInfoTable,
    mode: SweepMode,
    state: &mut SweptPageState,
) -> bool {
    state.swept_unmarked_size += header.allocated_size();
    // Objects that never finished construction are not finalized
    if !header.is_fully_constructed() {
        return false;
    }
    let index = header.gc_info_index();
    match mode {
        SweepMode::Inline => {
            // SAFETY: the object is unreachable and finalized exactly once.
            if unsafe { gc_info.finalize(index, header.payload()) } {
                state.objects_finalized += 1;
            }
            false
        }
        SweepMode::Deferred => {
            if gc_info.get(index).has_finalizer() {
                state.unfinalized_objects.push(header.address());
                true
            } else {
                false
            }
        }
    }
}

fn sweep_large_page(page: Arc<BasePage>, gc_info: &GcInfoTable, mode: SweepMode) -> SweptPageState {
    let mut state = SweptPageState::new(Arc::clone(&page));
    let header = page.large_object_header();
    if header.is_marked() {
        header.unmark();
        return state;
    }
    reclaim_dead_object(header, gc_info, mode, &mut state);
    state.is_empty = true;
    state
}

struct Gap {
    start: Address,
    end: Address,
    unfinalized: bool,
}

fn sweep_normal_page(page: Arc<BasePage>, gc_info: &GcInfoTable, mode: SweepMode) -> SweptPageState {
    let mut state = SweptPageState::new(Arc::clone(&page));
    let mut gap: Option<Gap> = None;
    let mut live_bytes = 0;
    let mut gaps = Vec::new();

    // SAFETY: buffers were returned before sweeping started, so the page is
    // walkable, and only this sweeper touches dead memory on it.
    unsafe {
        page.walk(|header| {
            let start = header.address();
            let end = header.object_end();
            if !header.is_free() && header.is_marked() {
                header.unmark();
                live_bytes += header.allocated_size();
                if let Some(closed) = gap.take() {
                    gaps.push(closed);
                }
                return;
            }
            let unfinalized =
                !header.is_free() && reclaim_dead_object(header, gc_info, mode, &mut state);
            match gap.as_mut() {
                Some(open) => {
                    open.end = end;
                    open.unfinalized |= unfinalized;
                }
                None => {
                    gap = Some(Gap {
                        start,
                        end,
                        unfinalized,
                    })
                }
            }
        });
    }
    if let Some(closed) = gap.take() {
        gaps.push(closed);
    }

    if live_bytes == 0 {
        state.is_empty = true;
        return state;
    }

    let bitmap = page.object_start_bitmap();
    for gap in gaps {
        let size = gap.end - gap.start;
        if gap.unfinalized {
            state.unfinalized_free_list.push(Block {
                address: gap.start,
                size,
            });
            continue;
        }
        // SAFETY: the gap holds only dead, finalized objects and free blocks.
        unsafe { std::ptr::write_bytes(gap.start as *mut u8, 0, size) };
        debug_assert!(size >= HEADER_SIZE);
        bitmap.clear_range(gap.start, gap.end);
        bitmap.set_bit(gap.start);
        // SAFETY: the range was just zeroed and belongs to this page.
        unsafe { state.cached_free_list.add(gap.start, size) };
        state.largest_new_free_list_entry = state.largest_new_free_list_entry.max(size);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{RawHeap, RegularSpaceType, NORMAL_PAGE_SIZE};
    use crate::marker::visitor::Visitor;
    use crate::object::gc_info::GcInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_finalizer(_payload: Address) {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
    }

    fn no_trace(_: &mut dyn Visitor, _: Address) {}

    struct Fixture {
        raw_heap: RawHeap,
        gc_info: GcInfoTable,
        index: u16,
    }

    impl Fixture {
        fn new() -> Self {
            let gc_info = GcInfoTable::new();
            let index = gc_info
                .register(GcInfo {
                    name: "Counted",
                    trace: no_trace,
                    finalize: Some(count_finalizer),
                })
                .unwrap();
            Self {
                raw_heap: RawHeap::new(&[], 0),
                gc_info,
                index,
            }
        }

        /// Page with `count` objects of `size` bytes and a trailing free block
        fn page_with_objects(&self, count: usize, size: usize) -> Arc<BasePage> {
            let space = self.raw_heap.regular_space(RegularSpaceType::Normal4);
            let page = self.raw_heap.allocate_normal_page(space).unwrap();
            let bitmap = page.object_start_bitmap();
            let mut address = page.payload_start();
            for _ in 0..count {
                let header = unsafe { HeapObjectHeader::initialize(address, size, self.index) };
                header.mark_as_fully_constructed();
                bitmap.set_bit(address);
                address += size;
            }
            let mut scratch = FreeList::new();
            unsafe { scratch.add(address, page.payload_end() - address) };
            bitmap.set_bit(address);
            page
        }

        fn header(&self, page: &BasePage, i: usize, size: usize) -> &'static HeapObjectHeader {
            unsafe { HeapObjectHeader::at(page.payload_start() + i * size) }
        }
    }

    #[test]
    fn test_inline_sweep_merges_dead_neighbours() {
        let fixture = Fixture::new();
        let page = fixture.page_with_objects(4, 64);
        fixture.header(&page, 0, 64).try_mark_atomic();
        fixture.header(&page, 3, 64).try_mark_atomic();
        let before = FINALIZED.load(Ordering::SeqCst);

        let state = sweep_page(page.clone(), &fixture.gc_info, SweepMode::Inline);

        assert!(!state.is_empty);
        assert_eq!(state.swept_unmarked_size, 128);
        assert_eq!(state.objects_finalized, 2);
        assert!(FINALIZED.load(Ordering::SeqCst) >= before + 2);
        // One gap between the survivors, one after them
        assert_eq!(state.cached_free_list.len(), 2);
        assert!(state.cached_free_list.contains(Block {
            address: page.payload_start() + 64,
            size: 128,
        }));
        assert_eq!(
            state.largest_new_free_list_entry,
            NORMAL_PAGE_SIZE - 4 * 64
        );
        assert!(!fixture.header(&page, 0, 64).is_marked());
        assert!(!page.object_start_bitmap().check_bit(page.payload_start() + 128));
    }

    #[test]
    fn test_deferred_sweep_leaves_finalizers_to_mutator() {
        let fixture = Fixture::new();
        let page = fixture.page_with_objects(2, 64);
        fixture.header(&page, 0, 64).try_mark_atomic();

        let mut state = sweep_page(page.clone(), &fixture.gc_info, SweepMode::Deferred);
        assert!(state.needs_finalization());
        assert_eq!(state.objects_finalized, 0);
        assert_eq!(state.unfinalized_objects.len(), 1);

        state.finalize(&fixture.gc_info);
        assert!(!state.needs_finalization());
        assert_eq!(state.objects_finalized, 1);
        assert!(state.cached_free_list.contains(Block {
            address: page.payload_start() + 64,
            size: NORMAL_PAGE_SIZE - 64,
        }));
    }

    #[test]
    fn test_page_without_survivors_is_empty() {
        let fixture = Fixture::new();
        let page = fixture.page_with_objects(3, 64);

        let state = sweep_page(page, &fixture.gc_info, SweepMode::Inline);

        assert!(state.is_empty);
        assert_eq!(state.swept_unmarked_size, 192);
    }

    #[test]
    fn test_unconstructed_dead_object_is_not_finalized() {
        let fixture = Fixture::new();
        let space = fixture.raw_heap.regular_space(RegularSpaceType::Normal4);
        let page = fixture.raw_heap.allocate_normal_page(space).unwrap();
        let start = page.payload_start();
        unsafe { HeapObjectHeader::initialize(start, 64, fixture.index) };
        page.object_start_bitmap().set_bit(start);
        let live = unsafe { HeapObjectHeader::initialize(start + 64, 64, fixture.index) };
        live.mark_as_fully_constructed();
        live.try_mark_atomic();
        page.object_start_bitmap().set_bit(start + 64);
        let mut scratch = FreeList::new();
        unsafe { scratch.add(start + 128, page.payload_end() - start - 128) };
        page.object_start_bitmap().set_bit(start + 128);

        let state = sweep_page(page, &fixture.gc_info, SweepMode::Inline);

        assert_eq!(state.objects_finalized, 0);
        assert_eq!(state.swept_unmarked_size, 64);
    }
}
