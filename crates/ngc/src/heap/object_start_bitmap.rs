//! Object Start Bitmap - Header lookup for inner pointers
//!
//! One bit per allocation granule of a normal page. A set bit means an
//! object (or free-list entry) header starts at that granule. Conservative
//! tracing maps an arbitrary address to its object by scanning backwards
//! for the closest set bit.
//!
//! Bitmap Structure:
//! ```text
//! Page payload: 128 KiB
//! Granularity:  8 bytes per bit
//! Bitmap size:  16384 bits = 256 words
//!
//! Header at payload + 0x40:
//! - Granule: 0x40 / 8 = 8
//! - Word:    8 / 64 = 0
//! - Bit:     8 % 64 = 8
//! ```
//!
//! Bits inside the current linear allocation buffer are always clear.

use crate::object::header::ALLOCATION_GRANULARITY;
use crate::util::Address;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

pub struct ObjectStartBitmap {
    base: Address,
    size: usize,
    words: Box<[AtomicU64]>,
}

impl ObjectStartBitmap {
    /// Bitmap covering `[base, base + size)`
    pub fn new(base: Address, size: usize) -> Self {
        let granules = size.div_ceil(ALLOCATION_GRANULARITY);
        let words = (0..granules.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { base, size, words }
    }

    #[inline]
    fn indices(&self, address: Address) -> (usize, usize) {
        debug_assert!(address >= self.base && address < self.base + self.size);
        debug_assert_eq!(address % ALLOCATION_GRANULARITY, 0);
        let granule = (address - self.base) / ALLOCATION_GRANULARITY;
        (granule / BITS_PER_WORD, granule % BITS_PER_WORD)
    }

    /// Record a header at `address`
    #[inline]
    pub fn set_bit(&self, address: Address) {
        let (word, bit) = self.indices(address);
        self.words[word].fetch_or(1 << bit, Ordering::Release);
    }

    #[inline]
    pub fn clear_bit(&self, address: Address) {
        let (word, bit) = self.indices(address);
        self.words[word].fetch_and(!(1 << bit), Ordering::Release);
    }

    #[inline]
    pub fn check_bit(&self, address: Address) -> bool {
        let (word, bit) = self.indices(address);
        self.words[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Clear every bit for granules in `[start, end)`
    pub fn clear_range(&self, start: Address, end: Address) {
        let mut address = start;
        while address < end {
            let (word, bit) = self.indices(address);
            if bit == 0 && address + BITS_PER_WORD * ALLOCATION_GRANULARITY <= end {
                self.words[word].store(0, Ordering::Release);
                address += BITS_PER_WORD * ALLOCATION_GRANULARITY;
            } else {
                self.words[word].fetch_and(!(1 << bit), Ordering::Release);
                address += ALLOCATION_GRANULARITY;
            }
        }
    }

    /// Closest header at or below `address`
    pub fn find_header(&self, address: Address) -> Option<Address> {
        if address < self.base || address >= self.base + self.size {
            return None;
        }
        let aligned = address & !(ALLOCATION_GRANULARITY - 1);
        let (mut word_index, bit) = self.indices(aligned);
        let mask = if bit == BITS_PER_WORD - 1 {
            u64::MAX
        } else {
            (1u64 << (bit + 1)) - 1
        };
        let mut word = self.words[word_index].load(Ordering::Acquire) & mask;
        while word == 0 {
            if word_index == 0 {
                return None;
            }
            word_index -= 1;
            word = self.words[word_index].load(Ordering::Acquire);
        }
        let highest = BITS_PER_WORD - 1 - word.leading_zeros() as usize;
        Some(self.base + (word_index * BITS_PER_WORD + highest) * ALLOCATION_GRANULARITY)
    }

    /// Visit every recorded header in address order
    pub fn iterate(&self, mut f: impl FnMut(Address)) {
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                f(self.base + (index * BITS_PER_WORD + bit) * ALLOCATION_GRANULARITY);
            }
        }
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

impl std::fmt::Debug for ObjectStartBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStartBitmap")
            .field("base", &crate::util::debug::format_address(self.base))
            .field("size", &self.size)
            .field("headers", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Address = 0x10_0000;
    const SIZE: usize = 4096;

    #[test]
    fn test_set_check_clear() {
        let bitmap = ObjectStartBitmap::new(BASE, SIZE);
        bitmap.set_bit(BASE + 64);

        assert!(bitmap.check_bit(BASE + 64));
        assert!(!bitmap.check_bit(BASE + 72));

        bitmap.clear_bit(BASE + 64);
        assert!(!bitmap.check_bit(BASE + 64));
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_find_header_scans_backwards() {
        let bitmap = ObjectStartBitmap::new(BASE, SIZE);
        bitmap.set_bit(BASE);
        bitmap.set_bit(BASE + 1024);

        assert_eq!(bitmap.find_header(BASE + 3), Some(BASE));
        assert_eq!(bitmap.find_header(BASE + 1023), Some(BASE));
        assert_eq!(bitmap.find_header(BASE + 1024), Some(BASE + 1024));
        assert_eq!(bitmap.find_header(BASE + 4000), Some(BASE + 1024));
        assert_eq!(bitmap.find_header(BASE + SIZE), None);
    }

    #[test]
    fn test_find_header_without_bits() {
        let bitmap = ObjectStartBitmap::new(BASE, SIZE);
        bitmap.set_bit(BASE + 2048);
        assert_eq!(bitmap.find_header(BASE + 8), None);
    }

    #[test]
    fn test_find_header_at_word_boundary() {
        let bitmap = ObjectStartBitmap::new(BASE, SIZE);
        // Granule 63 is the last bit of word 0
        bitmap.set_bit(BASE + 63 * 8);
        assert_eq!(bitmap.find_header(BASE + 63 * 8 + 7), Some(BASE + 63 * 8));
        assert_eq!(bitmap.find_header(BASE + 64 * 8), Some(BASE + 63 * 8));
    }

    #[test]
    fn test_clear_range_and_iterate() {
        let bitmap = ObjectStartBitmap::new(BASE, SIZE);
        for offset in (0..SIZE).step_by(16) {
            bitmap.set_bit(BASE + offset);
        }
        bitmap.clear_range(BASE + 16, BASE + SIZE - 16);

        let mut seen = Vec::new();
        bitmap.iterate(|address| seen.push(address));
        assert_eq!(seen, vec![BASE, BASE + SIZE - 16]);
    }
}
