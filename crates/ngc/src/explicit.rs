//! Explicit Management - Manual free and resize
//!
//! Lets the embedder give memory back before the next collection. Both
//! operations require a quiet heap: no marking, no atomic pause and no
//! sweeping in progress. Violations are debug assertions; release builds
//! log a warning and leave the object alone.
//!
//! Freed bytes go back to the linear allocation buffer when the object ends
//! exactly where the buffer starts, and to the free list otherwise.

use crate::allocator::allocated_size_for;
use crate::gc::HeapFlags;
use crate::heap::{BasePage, RawHeap, SpaceState};
use crate::logging::{GcEvent, GcLogger};
use crate::object::gc_info::GcInfoTable;
use crate::object::header::{HeapObjectHeader, HEADER_SIZE};
use crate::prefinalizer::PreFinalizerRegistry;
use crate::stats::StatsCollector;
use crate::sweeper::Sweeper;
use crate::util::Address;
use std::sync::Arc;

/// Smallest shrink worth a free-list entry, the smallest size class
pub const MIN_WORTHWHILE_FREE_SIZE: usize = 32;

pub struct ExplicitManagement {
    raw_heap: Arc<RawHeap>,
    gc_info: Arc<GcInfoTable>,
    stats: Arc<StatsCollector>,
    sweeper: Arc<Sweeper>,
    prefinalizers: Arc<PreFinalizerRegistry>,
    flags: Arc<HeapFlags>,
    logger: Arc<GcLogger>,
}

impl ExplicitManagement {
    pub fn new(
        raw_heap: Arc<RawHeap>,
        gc_info: Arc<GcInfoTable>,
        stats: Arc<StatsCollector>,
        sweeper: Arc<Sweeper>,
        prefinalizers: Arc<PreFinalizerRegistry>,
        flags: Arc<HeapFlags>,
        logger: Arc<GcLogger>,
    ) -> Self {
        Self {
            raw_heap,
            gc_info,
            stats,
            sweeper,
            prefinalizers,
            flags,
            logger,
        }
    }

    fn is_gc_quiet(&self, operation: &str) -> bool {
        let quiet =
            !self.flags.in_atomic_pause() && !self.flags.is_marking() && !self.sweeper.is_sweeping();
        debug_assert!(quiet, "{} called while a collection is in progress", operation);
        if !quiet {
            log::warn!("Ignoring {} during garbage collection", operation);
        }
        quiet
    }

    /// Finalize and free the object whose payload starts at `payload`
    ///
    /// The caller guarantees nothing references the object any more.
    pub fn free_unreferenced_object(&self, payload: Address) {
        if !self.is_gc_quiet("free_unreferenced_object") {
            return;
        }
        let Some(page) = self.raw_heap.lookup_page(payload) else {
            log::warn!("Ignoring free of non-heap address {:#x}", payload);
            return;
        };
        // SAFETY: `payload` is the start of a live object on `page`.
        let header = unsafe { HeapObjectHeader::from_payload(payload) };
        let size = header.allocated_size();
        let prefinalizers = self.prefinalizers.take_for(payload);

        if header.is_fully_constructed() {
            let _no_allocation = self.flags.no_allocation_scope();
            for prefinalizer in prefinalizers {
                prefinalizer(payload);
            }
            // SAFETY: the caller guarantees the object is unreferenced.
            unsafe { self.gc_info.finalize(header.gc_info_index(), payload) };
        }

        if page.is_large() {
            self.raw_heap.release_page(&page);
        } else {
            let space = self.raw_heap.space(page.space_index());
            let mut state = space.lock();
            free_in_normal_page(&mut state, &page, header);
        }

        log::trace!("Explicitly freed {} bytes at {:#x}", size, payload);
        self.logger.log(GcEvent::ExplicitFree { bytes: size });
        self.stats.notify_explicit_free(size);
    }

    /// Change the payload size of the object at `payload` in place
    ///
    /// Returns false if the object cannot be resized in place; the caller
    /// then allocates a new object and copies.
    pub fn resize_object(&self, payload: Address, new_size: usize) -> bool {
        if !self.is_gc_quiet("resize_object") {
            return false;
        }
        let Some(page) = self.raw_heap.lookup_page(payload) else {
            return false;
        };
        if page.is_large() {
            return false;
        }
        let Ok(new_allocated) = allocated_size_for(new_size) else {
            return false;
        };
        // SAFETY: `payload` is the start of a live object on `page`.
        let header = unsafe { HeapObjectHeader::from_payload(payload) };
        let old_allocated = header.allocated_size();

        if new_allocated > old_allocated {
            self.grow(&page, header, new_allocated)
        } else if new_allocated < old_allocated {
            self.shrink(&page, header, new_allocated)
        } else {
            true
        }
    }

    fn grow(&self, page: &Arc<BasePage>, header: &HeapObjectHeader, new_allocated: usize) -> bool {
        let delta = new_allocated - header.allocated_size();
        {
            let mut state = self.raw_heap.space(page.space_index()).lock();
            if !lab_starts_at(&state, page, header.object_end()) || state.lab.size() < delta {
                return false;
            }
            // Buffer memory is already zero
            state.lab.allocate(delta);
            header.set_allocated_size(new_allocated);
        }
        self.stats.notify_allocation(delta);
        true
    }

    fn shrink(&self, page: &Arc<BasePage>, header: &HeapObjectHeader, new_allocated: usize) -> bool {
        let old_end = header.object_end();
        let tail = header.address() + new_allocated;
        let delta = old_end - tail;
        {
            let mut state = self.raw_heap.space(page.space_index()).lock();
            if lab_starts_at(&state, page, old_end) {
                zero(tail, delta);
                state.lab.extend_downwards(tail);
            } else if delta >= MIN_WORTHWHILE_FREE_SIZE {
                zero(tail, delta);
                // SAFETY: the tail was just zeroed and belongs to this space.
                unsafe { state.free_list.add(tail, delta) };
                page.object_start_bitmap().set_bit(tail);
            } else {
                return false;
            }
            header.set_allocated_size(new_allocated);
        }
        self.stats.notify_explicit_free(delta);
        true
    }
}

impl std::fmt::Debug for ExplicitManagement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplicitManagement").finish_non_exhaustive()
    }
}

fn lab_starts_at(state: &SpaceState, page: &BasePage, address: Address) -> bool {
    state.lab.page().is_some_and(|lab_page| lab_page.id() == page.id()) && state.lab.start() == address
}

fn zero(start: Address, size: usize) {
    // SAFETY: callers pass memory of a dead object or tail on a live page.
    unsafe { std::ptr::write_bytes(start as *mut u8, 0, size) };
}

fn free_in_normal_page(state: &mut SpaceState, page: &BasePage, header: &HeapObjectHeader) {
    let start = header.address();
    let size = header.allocated_size();
    debug_assert!(size >= HEADER_SIZE);
    page.object_start_bitmap().clear_bit(start);
    let folds_into_lab = lab_starts_at(state, page, start + size);
    zero(start, size);
    if folds_into_lab {
        state.lab.extend_downwards(start);
    } else {
        // SAFETY: the object was just zeroed and belongs to this space.
        unsafe { state.free_list.add(start, size) };
        page.object_start_bitmap().set_bit(start);
    }
}
