//! Object Header - Metadata for GC-managed objects
//!
//! Every object is preceded by an 8-byte header. The payload starts right
//! after it.
//!
//! Header Layout (8 bytes):
//! ┌─────────────────────────────────────────┐
//! │       High Word (4 bytes)               │  <- AtomicU32
//! │  - Bits 0-15: GC info index             │
//! │  - Bit 31: Fully constructed            │
//! ├─────────────────────────────────────────┤
//! │       Low Word (4 bytes)                │  <- AtomicU32
//! │  - Bit 0: Marked                        │
//! │  - Bit 1: Weak container marked         │
//! │  - Bits 3-31: Allocated size            │
//! └─────────────────────────────────────────┘
//!
//! The allocated size covers header and payload and is a multiple of the
//! allocation granularity, so its low three bits are free for flags.
//!
//! GC info index 0 marks free-list entries and fillers. Those blocks use the
//! same header so the sweeper can walk a page linearly.
//!
//! # Ordering
//!
//! - The fully-constructed bit has a single writer (the allocating thread)
//!   and is published with a release store. Readers use acquire loads.
//! - The mark bit is set with an atomic test-and-set since the mutator and
//!   background markers race on it.

use crate::object::gc_info::GcInfoIndex;
use crate::util::Address;
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of object header in bytes
pub const HEADER_SIZE: usize = 8;

/// Allocation granularity in bytes
pub const ALLOCATION_GRANULARITY: usize = 8;

/// GC info index reserved for free-list entries and fillers
pub const FREE_LIST_GC_INFO_INDEX: GcInfoIndex = 0;

/// Largest allocated size the header can encode
pub const MAX_ENCODABLE_SIZE: usize = (u32::MAX as usize) & !(ALLOCATION_GRANULARITY - 1);

const GC_INFO_INDEX_MASK: u32 = 0xFFFF;
const FULLY_CONSTRUCTED_MASK: u32 = 1 << 31;

const MARK_MASK: u32 = 1 << 0;
const WEAK_CONTAINER_MASK: u32 = 1 << 1;
const SIZE_MASK: u32 = !0b111;

/// Heap object header
#[repr(C)]
pub struct HeapObjectHeader {
    high: AtomicU32,
    low: AtomicU32,
}

impl HeapObjectHeader {
    /// Write a fresh header at `address`
    ///
    /// # Safety
    ///
    /// `address` must point to `HEADER_SIZE` writable bytes inside a page
    /// that nothing else accesses concurrently.
    #[inline]
    pub unsafe fn initialize<'a>(
        address: Address,
        allocated_size: usize,
        gc_info_index: GcInfoIndex,
    ) -> &'a HeapObjectHeader {
        debug_assert_eq!(address % ALLOCATION_GRANULARITY, 0);
        debug_assert_eq!(allocated_size % ALLOCATION_GRANULARITY, 0);
        debug_assert!(allocated_size <= MAX_ENCODABLE_SIZE);
        let header = &*(address as *const HeapObjectHeader);
        header.high.store(u32::from(gc_info_index), Ordering::Relaxed);
        header.low.store(allocated_size as u32, Ordering::Relaxed);
        header
    }

    /// View the header stored at `address`
    ///
    /// # Safety
    ///
    /// `address` must be the start of a header on a live page.
    #[inline]
    pub unsafe fn at<'a>(address: Address) -> &'a HeapObjectHeader {
        &*(address as *const HeapObjectHeader)
    }

    /// View the header of the object whose payload starts at `payload`
    ///
    /// # Safety
    ///
    /// `payload` must be the payload start of an object on a live page.
    #[inline]
    pub unsafe fn from_payload<'a>(payload: Address) -> &'a HeapObjectHeader {
        Self::at(payload - HEADER_SIZE)
    }

    #[inline]
    pub fn address(&self) -> Address {
        self as *const HeapObjectHeader as Address
    }

    #[inline]
    pub fn payload(&self) -> Address {
        self.address() + HEADER_SIZE
    }

    /// First address after the object
    #[inline]
    pub fn object_end(&self) -> Address {
        self.address() + self.allocated_size()
    }

    /// Size including the header
    #[inline]
    pub fn allocated_size(&self) -> usize {
        (self.low.load(Ordering::Relaxed) & SIZE_MASK) as usize
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.allocated_size() - HEADER_SIZE
    }

    /// Update the allocated size, keeping the flag bits
    ///
    /// Only used outside of marking, when no other thread reads the header.
    #[inline]
    pub fn set_allocated_size(&self, allocated_size: usize) {
        debug_assert_eq!(allocated_size % ALLOCATION_GRANULARITY, 0);
        let flags = self.low.load(Ordering::Relaxed) & !SIZE_MASK;
        self.low.store(flags | allocated_size as u32, Ordering::Relaxed);
    }

    #[inline]
    pub fn gc_info_index(&self) -> GcInfoIndex {
        (self.high.load(Ordering::Relaxed) & GC_INFO_INDEX_MASK) as GcInfoIndex
    }

    /// Free-list entry or filler
    #[inline]
    pub fn is_free(&self) -> bool {
        self.gc_info_index() == FREE_LIST_GC_INFO_INDEX
    }

    // === Construction ===

    #[inline]
    pub fn is_in_construction(&self) -> bool {
        self.high.load(Ordering::Acquire) & FULLY_CONSTRUCTED_MASK == 0
    }

    #[inline]
    pub fn is_fully_constructed(&self) -> bool {
        !self.is_in_construction()
    }

    /// Publish the object as fully constructed
    ///
    /// Plain read followed by a release store. Only the allocating thread
    /// writes this bit, which [`UnconstructedObject`] guarantees by owning
    /// the only path to this call.
    ///
    /// [`UnconstructedObject`]: crate::allocator::UnconstructedObject
    #[inline]
    pub(crate) fn mark_as_fully_constructed(&self) {
        let current = self.high.load(Ordering::Relaxed);
        debug_assert_eq!(current & FULLY_CONSTRUCTED_MASK, 0);
        self.high
            .store(current | FULLY_CONSTRUCTED_MASK, Ordering::Release);
    }

    // === Mark Bit Operations ===

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.low.load(Ordering::Acquire) & MARK_MASK != 0
    }

    /// Set the mark bit atomically
    /// Returns true if this call set it
    #[inline]
    pub fn try_mark_atomic(&self) -> bool {
        self.low.fetch_or(MARK_MASK, Ordering::AcqRel) & MARK_MASK == 0
    }

    /// Clear mark and weak-container bits
    #[inline]
    pub fn unmark(&self) {
        self.low
            .fetch_and(!(MARK_MASK | WEAK_CONTAINER_MASK), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_weak_container_marked(&self) -> bool {
        self.low.load(Ordering::Acquire) & WEAK_CONTAINER_MASK != 0
    }

    #[inline]
    pub fn set_weak_container_marked(&self) {
        self.low.fetch_or(WEAK_CONTAINER_MASK, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HeapObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapObjectHeader")
            .field("address", &crate::util::debug::format_address(self.address()))
            .field("size", &self.allocated_size())
            .field("gc_info", &self.gc_info_index())
            .field("marked", &self.is_marked())
            .field("constructed", &self.is_fully_constructed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Slot([u8; 64]);

    fn header_in(slot: &mut Slot, size: usize, index: GcInfoIndex) -> &HeapObjectHeader {
        unsafe { HeapObjectHeader::initialize(slot.0.as_mut_ptr() as Address, size, index) }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<HeapObjectHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_initialize_stamps_size_and_index() {
        let mut slot = Slot([0xAA; 64]);
        let header = header_in(&mut slot, 48, 7);

        assert_eq!(header.allocated_size(), 48);
        assert_eq!(header.payload_size(), 40);
        assert_eq!(header.gc_info_index(), 7);
        assert!(!header.is_marked());
        assert!(header.is_in_construction());
        assert!(!header.is_free());
        assert_eq!(header.payload(), header.address() + HEADER_SIZE);
        assert_eq!(header.object_end(), header.address() + 48);
    }

    #[test]
    fn test_fully_constructed_bit() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 16, 3);

        assert!(header.is_in_construction());
        header.mark_as_fully_constructed();
        assert!(header.is_fully_constructed());
        assert_eq!(header.gc_info_index(), 3);
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 32, 1);

        assert!(header.try_mark_atomic());
        assert!(!header.try_mark_atomic());
        assert!(header.is_marked());
        assert_eq!(header.allocated_size(), 32);

        header.set_weak_container_marked();
        header.unmark();
        assert!(!header.is_marked());
        assert!(!header.is_weak_container_marked());
    }

    #[test]
    fn test_set_allocated_size_keeps_flags() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 32, 1);
        header.try_mark_atomic();

        header.set_allocated_size(56);
        assert_eq!(header.allocated_size(), 56);
        assert!(header.is_marked());
    }

    #[test]
    fn test_free_header() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 24, FREE_LIST_GC_INFO_INDEX);
        assert!(header.is_free());
    }
}
