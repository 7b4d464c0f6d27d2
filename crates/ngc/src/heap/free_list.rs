//! Free List - Reusable blocks of a normal space
//!
//! Blocks are bucketed by `floor(log2(size))`. Every block carries a free
//! header (GC info index 0) so pages stay walkable; the rest of a block is
//! zero.
//!
//! Blocks smaller than [`MIN_FREE_LIST_ENTRY_SIZE`] only get a filler header
//! and are not listed.

use crate::object::header::{HeapObjectHeader, ALLOCATION_GRANULARITY, FREE_LIST_GC_INFO_INDEX, HEADER_SIZE};
use crate::util::Address;

/// Smallest block worth listing: a header plus one granule
pub const MIN_FREE_LIST_ENTRY_SIZE: usize = HEADER_SIZE + ALLOCATION_GRANULARITY;

const BUCKET_COUNT: usize = usize::BITS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub address: Address,
    pub size: usize,
}

#[derive(Debug, Default)]
pub struct FreeList {
    buckets: Vec<Vec<Block>>,
    biggest_bucket: Option<usize>,
    total_size: usize,
}

#[inline]
fn bucket_index_for_size(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

impl FreeList {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); BUCKET_COUNT],
            biggest_bucket: None,
            total_size: 0,
        }
    }

    /// Turn `[address, address + size)` into a free block
    ///
    /// Returns true if the block was listed, false if it only became a
    /// filler.
    ///
    /// # Safety
    ///
    /// The range must be unused memory inside one page, zero except for
    /// possibly a previous free header at `address`.
    pub unsafe fn add(&mut self, address: Address, size: usize) -> bool {
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        HeapObjectHeader::initialize(address, size, FREE_LIST_GC_INFO_INDEX);
        if size < MIN_FREE_LIST_ENTRY_SIZE {
            return false;
        }
        self.push(Block { address, size });
        true
    }

    /// List a block whose free header is already written
    pub(crate) fn push(&mut self, block: Block) {
        if self.buckets.is_empty() {
            self.buckets = vec![Vec::new(); BUCKET_COUNT];
        }
        let index = bucket_index_for_size(block.size);
        self.buckets[index].push(block);
        self.total_size += block.size;
        if self.biggest_bucket.is_none_or(|biggest| index > biggest) {
            self.biggest_bucket = Some(index);
        }
    }

    /// Take a block of at least `size` bytes
    ///
    /// Starts at the biggest bucket so a slow-path refill gets as much
    /// memory as possible at once.
    pub fn allocate(&mut self, size: usize) -> Option<Block> {
        let biggest = self.biggest_bucket?;
        let smallest = bucket_index_for_size(size);
        let mut index = biggest;
        loop {
            let bucket = &mut self.buckets[index];
            if let Some(pos) = bucket.iter().rposition(|block| block.size >= size) {
                let block = bucket.swap_remove(pos);
                self.total_size -= block.size;
                self.update_biggest_bucket();
                return Some(block);
            }
            if index == smallest || index == 0 {
                return None;
            }
            index -= 1;
        }
    }

    /// Move every block of `other` into `self`
    pub fn append(&mut self, other: &mut FreeList) {
        for bucket in other.buckets.iter_mut() {
            for block in bucket.drain(..) {
                self.push(block);
            }
        }
        other.total_size = 0;
        other.biggest_bucket = None;
    }

    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
        self.total_size = 0;
        self.biggest_bucket = None;
    }

    pub fn is_empty(&self) -> bool {
        self.biggest_bucket.is_none()
    }

    /// Sum of listed block sizes
    pub fn size(&self) -> usize {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn contains(&self, block: Block) -> bool {
        if block.size == 0 {
            return false;
        }
        self.buckets
            .get(bucket_index_for_size(block.size))
            .is_some_and(|bucket| bucket.contains(&block))
    }

    pub fn largest_block_size(&self) -> usize {
        self.biggest_bucket
            .and_then(|index| self.buckets[index].iter().map(|b| b.size).max())
            .unwrap_or(0)
    }

    fn update_biggest_bucket(&mut self) {
        while let Some(index) = self.biggest_bucket {
            if !self.buckets[index].is_empty() {
                return;
            }
            self.biggest_bucket = index.checked_sub(1);
        }
    }
}
