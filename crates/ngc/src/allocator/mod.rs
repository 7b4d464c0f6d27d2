//! Allocator Module - Object allocation
//!
//! Every space keeps a linear allocation buffer (LAB). Allocation bumps the
//! buffer; when it runs dry the slow path refills it.
//!
//! ## Allocation Flow
//!
//! 1. Resolve alignment: `max(alignment, 8)`, anything above 16 aborts
//! 2. Large object (>= 64 KiB) -> dedicated page in the large space
//! 3. Otherwise bump the LAB of the size-class or custom space
//! 4. LAB too small -> refill from the space's free list
//! 5. Free list empty -> sweep that space for a bounded time, then retry
//! 6. Still nothing -> finish sweeping, then retry
//! 7. Still nothing -> map a fresh page
//!
//! The returned [`UnconstructedObject`] owns the only path to flipping the
//! fully-constructed bit. Until it is consumed the object sits in the
//! heap's construction registry, which marking treats as a root.

use crate::error::{NgcError, Result};
use crate::gc::HeapFlags;
use crate::heap::{BasePage, RawHeap, RegularSpaceType, Space, SpaceState, LARGE_OBJECT_SIZE_THRESHOLD};
use crate::marker::roots::ConstructionRegistry;
use crate::object::gc_info::GcInfoIndex;
use crate::object::header::{
    HeapObjectHeader, ALLOCATION_GRANULARITY, FREE_LIST_GC_INFO_INDEX, HEADER_SIZE, MAX_ENCODABLE_SIZE,
};
use crate::stats::StatsCollector;
use crate::sweeper::Sweeper;
use crate::util::{Address, Alignment};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// Alignment every allocation gets
pub const DEFAULT_ALIGNMENT: usize = ALLOCATION_GRANULARITY;

/// Largest alignment the allocator can place
pub const MAX_SUPPORTED_ALIGNMENT: usize = 2 * DEFAULT_ALIGNMENT;

/// Largest payload a single object may have
pub const MAX_OBJECT_SIZE: usize = MAX_ENCODABLE_SIZE - HEADER_SIZE;

/// Resolve the alignment of a request
///
/// Aborts for alignments the allocator cannot place.
#[inline]
pub fn resolve_alignment(alignment: usize) -> usize {
    if !alignment.is_power_of_two() && alignment != 0 {
        crate::fatal!("alignment {} is not a power of two", alignment);
    }
    let effective = alignment.max(DEFAULT_ALIGNMENT);
    if effective > MAX_SUPPORTED_ALIGNMENT {
        crate::fatal!(
            "alignment {} exceeds the maximum supported alignment {}",
            effective,
            MAX_SUPPORTED_ALIGNMENT
        );
    }
    effective
}

/// Size of an object including its header
#[inline]
pub fn allocated_size_for(size: usize) -> Result<usize> {
    if size > MAX_OBJECT_SIZE {
        return Err(NgcError::ObjectTooLarge {
            size,
            max: MAX_OBJECT_SIZE,
        });
    }
    // Zero-sized objects still get a distinct payload byte
    Ok(Alignment::align_up(size.max(1) + HEADER_SIZE, ALLOCATION_GRANULARITY))
}

/// Freshly allocated object whose constructor has not finished
///
/// The payload is zeroed. Consuming the handle with
/// [`mark_fully_constructed`](Self::mark_fully_constructed) publishes the
/// object to tracers; dropping it leaves the object in construction, so the
/// next collection reclaims it without running its finalizer.
#[must_use = "the object stays in construction until marked fully constructed"]
pub struct UnconstructedObject {
    payload: NonNull<u8>,
    registry: Arc<ConstructionRegistry>,
}

impl UnconstructedObject {
    /// Start of the zeroed payload
    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        self.payload
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.payload.as_ptr() as Address
    }

    #[inline]
    pub fn header(&self) -> &HeapObjectHeader {
        // SAFETY: the payload belongs to an allocated object that cannot be
        // swept while it is registered as in construction.
        unsafe { HeapObjectHeader::from_payload(self.address()) }
    }

    /// Publish the object as fully constructed
    pub fn mark_fully_constructed(self) -> NonNull<u8> {
        self.header().mark_as_fully_constructed();
        self.payload
    }
}

impl Drop for UnconstructedObject {
    fn drop(&mut self) {
        self.registry.unregister(self.address());
    }
}

impl std::fmt::Debug for UnconstructedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnconstructedObject")
            .field("payload", &crate::util::debug::format_address(self.address()))
            .field("size", &self.header().allocated_size())
            .finish()
    }
}

/// Allocates objects into the spaces of one heap
pub struct ObjectAllocator {
    raw_heap: Arc<RawHeap>,
    stats: Arc<StatsCollector>,
    sweeper: Arc<Sweeper>,
    registry: Arc<ConstructionRegistry>,
    flags: Arc<HeapFlags>,
    sweep_for_allocation_budget: Duration,
}

impl ObjectAllocator {
    pub fn new(
        raw_heap: Arc<RawHeap>,
        stats: Arc<StatsCollector>,
        sweeper: Arc<Sweeper>,
        registry: Arc<ConstructionRegistry>,
        flags: Arc<HeapFlags>,
        sweep_for_allocation_budget: Duration,
    ) -> Self {
        Self {
            raw_heap,
            stats,
            sweeper,
            registry,
            flags,
            sweep_for_allocation_budget,
        }
    }

    /// Allocate `size` payload bytes with `alignment`
    ///
    /// `custom_space` picks a custom space by its index among custom spaces;
    /// `None` picks the regular space for the size class. Large objects
    /// always go to the large space.
    pub fn allocate(
        &self,
        size: usize,
        alignment: usize,
        custom_space: Option<usize>,
        gc_info: GcInfoIndex,
    ) -> Result<UnconstructedObject> {
        let alignment = resolve_alignment(alignment);
        debug_assert_ne!(gc_info, FREE_LIST_GC_INFO_INDEX);
        if !self.flags.is_allocation_allowed() {
            return Err(NgcError::invalid_state(
                "allocation allowed",
                "allocation from a finalizer",
            ));
        }
        let allocated_size = allocated_size_for(size)?;

        let header = if allocated_size >= LARGE_OBJECT_SIZE_THRESHOLD {
            self.allocate_large(allocated_size, gc_info)?
        } else {
            let space = self.space_for(allocated_size, custom_space)?;
            self.allocate_in_space(space, allocated_size, alignment, gc_info)?
        };

        let payload = header + HEADER_SIZE;
        debug_assert!(Alignment::is_aligned(payload, alignment));
        self.registry.register(payload);
        let object = UnconstructedObject {
            // SAFETY: page memory is never mapped at address zero.
            payload: unsafe { NonNull::new_unchecked(payload as *mut u8) },
            registry: Arc::clone(&self.registry),
        };
        log::trace!(
            "Allocated {} bytes at {:#x} (gc info {})",
            allocated_size,
            payload,
            gc_info
        );
        // May start a collection; the object is already a construction root.
        self.stats.notify_allocation(allocated_size);
        Ok(object)
    }

    fn space_for(&self, allocated_size: usize, custom_space: Option<usize>) -> Result<&Space> {
        match custom_space {
            None => Ok(self
                .raw_heap
                .regular_space(RegularSpaceType::for_size(allocated_size))),
            Some(index) => self
                .raw_heap
                .custom_space(index)
                .ok_or(NgcError::UnknownCustomSpace {
                    index,
                    count: self.raw_heap.custom_space_count(),
                }),
        }
    }

    fn allocate_large(&self, allocated_size: usize, gc_info: GcInfoIndex) -> Result<Address> {
        let space = self.raw_heap.regular_space(RegularSpaceType::Large);
        let page = self.raw_heap.allocate_large_page(space, allocated_size)?;
        let address = page.payload_start();
        // SAFETY: the page is fresh, zeroed and not yet published.
        unsafe { HeapObjectHeader::initialize(address, allocated_size, gc_info) };
        space.lock().pages.push(page.id());
        Ok(address)
    }

    /// Slow path loop for a normal space
    fn allocate_in_space(
        &self,
        space: &Space,
        allocated_size: usize,
        alignment: usize,
        gc_info: GcInfoIndex,
    ) -> Result<Address> {
        // Enough for the object plus a possible alignment filler
        let needed = allocated_size + (alignment - DEFAULT_ALIGNMENT);

        {
            let mut state = space.lock();
            if let Some(address) = bump(&mut state, allocated_size, alignment, gc_info) {
                return Ok(address);
            }
            if self.refill_from_free_list(&mut state, needed) {
                return bump(&mut state, allocated_size, alignment, gc_info)
                    .ok_or_else(|| NgcError::Internal("refilled buffer too small".to_string()));
            }
        }

        if self.sweeper.is_sweeping() {
            self.sweeper.sweep_for_allocation_if_running(
                space.index(),
                needed,
                self.sweep_for_allocation_budget,
            );
            if let Some(address) = self.try_free_list(space, allocated_size, alignment, gc_info, needed) {
                return Ok(address);
            }
            self.sweeper.finish_if_running();
            if let Some(address) = self.try_free_list(space, allocated_size, alignment, gc_info, needed) {
                return Ok(address);
            }
        }

        let page = self.raw_heap.allocate_normal_page(space)?;
        let mut state = space.lock();
        state.pages.push(page.id());
        RawHeap::return_lab_to_free_list(&mut state);
        let (start, size) = (page.payload_start(), page.payload_size());
        state.lab.set(page, start, size);
        bump(&mut state, allocated_size, alignment, gc_info).ok_or(NgcError::OutOfMemory {
            requested: allocated_size,
            available: size,
        })
    }

    fn try_free_list(
        &self,
        space: &Space,
        allocated_size: usize,
        alignment: usize,
        gc_info: GcInfoIndex,
        needed: usize,
    ) -> Option<Address> {
        let mut state = space.lock();
        if let Some(address) = bump(&mut state, allocated_size, alignment, gc_info) {
            return Some(address);
        }
        if self.refill_from_free_list(&mut state, needed) {
            return bump(&mut state, allocated_size, alignment, gc_info);
        }
        None
    }

    /// Replace the buffer with a free-list block of at least `needed` bytes
    fn refill_from_free_list(&self, state: &mut SpaceState, needed: usize) -> bool {
        let Some(block) = state.free_list.allocate(needed) else {
            return false;
        };
        let Some(page) = self.raw_heap.lookup_page(block.address) else {
            crate::fatal!("free-list block {:#x} is outside the heap", block.address);
        };
        // SAFETY: the block is free memory of this space; only its header
        // word is non-zero.
        unsafe { std::ptr::write_bytes(block.address as *mut u8, 0, HEADER_SIZE) };
        page.object_start_bitmap().clear_bit(block.address);

        RawHeap::return_lab_to_free_list(state);
        state.lab.set(page, block.address, block.size);
        true
    }
}

impl std::fmt::Debug for ObjectAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAllocator")
            .field("sweep_for_allocation_budget", &self.sweep_for_allocation_budget)
            .finish()
    }
}

/// Bump an object out of the space's buffer
///
/// Inserts an 8-byte filler when a 16-byte aligned payload needs it.
fn bump(
    state: &mut SpaceState,
    allocated_size: usize,
    alignment: usize,
    gc_info: GcInfoIndex,
) -> Option<Address> {
    let page: Arc<BasePage> = state.lab.page()?.clone();
    let filler = Alignment::padding(state.lab.start() + HEADER_SIZE, alignment);
    if state.lab.size() < allocated_size + filler {
        return None;
    }
    if filler > 0 {
        let address = state.lab.allocate(filler);
        // SAFETY: buffer memory is zero and owned by this space.
        unsafe { HeapObjectHeader::initialize(address, filler, FREE_LIST_GC_INFO_INDEX) };
        page.object_start_bitmap().set_bit(address);
    }
    let address = state.lab.allocate(allocated_size);
    // SAFETY: as above.
    unsafe { HeapObjectHeader::initialize(address, allocated_size, gc_info) };
    page.object_start_bitmap().set_bit(address);
    Some(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepingType;
    use crate::heap::NORMAL_PAGE_SIZE;
    use crate::object::gc_info::{GcInfo, GcInfoTable};
    use crate::platform::DefaultPlatform;
    use crate::sweeper::SweeperConfig;

    fn noop_trace(_: &mut dyn crate::marker::Visitor, _: Address) {}

    struct Fixture {
        raw_heap: Arc<RawHeap>,
        stats: Arc<StatsCollector>,
        registry: Arc<ConstructionRegistry>,
        allocator: ObjectAllocator,
        gc_info: GcInfoIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let raw_heap = Arc::new(RawHeap::new(&[], 0));
            let table = Arc::new(GcInfoTable::new());
            let gc_info = table
                .register(GcInfo {
                    name: "Blob",
                    trace: noop_trace,
                    finalize: None,
                })
                .unwrap();
            let stats = Arc::new(StatsCollector::new());
            let flags = Arc::new(HeapFlags::default());
            let sweeper = Sweeper::new(
                Arc::clone(&raw_heap),
                table,
                Arc::clone(&stats),
                Arc::new(DefaultPlatform::without_task_runner()),
                Arc::clone(&flags),
                SweeperConfig {
                    sweeping_threads: 1,
                    incremental_step: Duration::from_millis(5),
                },
            );
            let registry = Arc::new(ConstructionRegistry::new());
            let allocator = ObjectAllocator::new(
                Arc::clone(&raw_heap),
                Arc::clone(&stats),
                sweeper,
                Arc::clone(&registry),
                flags,
                Duration::from_millis(1),
            );
            Self {
                raw_heap,
                stats,
                registry,
                allocator,
                gc_info,
            }
        }
    }

    #[test]
    fn test_allocation_is_zeroed_and_in_construction() {
        let fx = Fixture::new();
        let object = fx.allocator.allocate(40, 8, None, fx.gc_info).unwrap();

        let bytes = unsafe { std::slice::from_raw_parts(object.payload().as_ptr(), 40) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(object.header().is_in_construction());
        assert_eq!(object.header().allocated_size(), 48);
        assert!(fx.registry.contains(object.address()));

        let payload = object.mark_fully_constructed();
        let header = unsafe { HeapObjectHeader::from_payload(payload.as_ptr() as Address) };
        assert!(header.is_fully_constructed());
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn test_size_classes_pick_spaces() {
        let fx = Fixture::new();
        let small = fx.allocator.allocate(16, 8, None, fx.gc_info).unwrap();
        let medium = fx.allocator.allocate(100, 8, None, fx.gc_info).unwrap();

        let small_page = fx.raw_heap.lookup_page(small.address()).unwrap();
        let medium_page = fx.raw_heap.lookup_page(medium.address()).unwrap();
        assert_eq!(small_page.space_index(), RegularSpaceType::Normal1.index());
        assert_eq!(medium_page.space_index(), RegularSpaceType::Normal3.index());
    }

    #[test]
    fn test_sixteen_byte_alignment_inserts_filler() {
        let fx = Fixture::new();
        // A 32-byte object leaves the buffer start 16-byte aligned, so the
        // next 16-byte aligned payload needs a filler
        let _first = fx.allocator.allocate(24, 8, None, fx.gc_info).unwrap();
        let aligned = fx.allocator.allocate(16, 16, None, fx.gc_info).unwrap();
        assert_eq!(aligned.address() % 16, 0);

        let page = fx.raw_heap.lookup_page(aligned.address()).unwrap();
        let mut headers = Vec::new();
        page.iterate_headers(|h| headers.push((h.allocated_size(), h.is_free())));
        assert!(headers.contains(&(8, true)));
    }

    #[test]
    fn test_large_object_gets_own_page() {
        let fx = Fixture::new();
        let object = fx
            .allocator
            .allocate(LARGE_OBJECT_SIZE_THRESHOLD, 16, None, fx.gc_info)
            .unwrap();
        let page = fx.raw_heap.lookup_page(object.address()).unwrap();

        assert!(page.is_large());
        assert_eq!(object.address() % 16, 0);
        assert_eq!(page.large_object_header().payload(), object.address());
    }

    #[test]
    fn test_unknown_custom_space_is_refused() {
        let fx = Fixture::new();
        let result = fx.allocator.allocate(16, 8, Some(3), fx.gc_info);
        assert!(matches!(
            result,
            Err(NgcError::UnknownCustomSpace { index: 3, count: 0 })
        ));
    }

    #[test]
    fn test_oversized_request_is_refused() {
        let fx = Fixture::new();
        let result = fx.allocator.allocate(MAX_OBJECT_SIZE + 1, 8, None, fx.gc_info);
        assert!(matches!(result, Err(NgcError::ObjectTooLarge { .. })));
    }

    #[test]
    fn test_new_page_when_buffer_exhausted() {
        let fx = Fixture::new();
        let size = 16 * 1024;
        let per_page = NORMAL_PAGE_SIZE / (size + HEADER_SIZE);
        let objects: Vec<_> = (0..=per_page)
            .map(|_| fx.allocator.allocate(size, 8, None, fx.gc_info).unwrap())
            .collect();
        let space = fx.raw_heap.regular_space(RegularSpaceType::Normal4);
        assert_eq!(space.page_count(), 2);
        assert_eq!(
            fx.stats.allocated_object_size(),
            objects.len() * (size + HEADER_SIZE)
        );
    }

    #[test]
    fn test_dropped_handle_leaves_object_in_construction() {
        let fx = Fixture::new();
        let object = fx.allocator.allocate(24, 8, None, fx.gc_info).unwrap();
        let address = object.address();
        drop(object);

        let header = unsafe { HeapObjectHeader::from_payload(address) };
        assert!(header.is_in_construction());
        assert!(!fx.registry.contains(address));
    }

    #[test]
    fn test_refill_from_swept_free_list() {
        let fx = Fixture::new();
        for _ in 0..4 {
            let object = fx.allocator.allocate(200, 8, None, fx.gc_info).unwrap();
            let _ = object.mark_fully_constructed();
        }
        // Nothing is marked, so the page is swept empty and released
        fx.allocator.sweeper.start(SweepingType::Atomic);
        let space = fx.raw_heap.regular_space(RegularSpaceType::Normal4);
        assert_eq!(space.page_count(), 0);

        let object = fx.allocator.allocate(200, 8, None, fx.gc_info).unwrap();
        assert!(fx.raw_heap.lookup_page(object.address()).is_some());
        assert_eq!(space.page_count(), 1);
    }

    #[test]
    fn test_resolve_alignment() {
        assert_eq!(resolve_alignment(1), 8);
        assert_eq!(resolve_alignment(8), 8);
        assert_eq!(resolve_alignment(16), 16);
    }
}
