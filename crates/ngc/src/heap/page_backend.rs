//! Page Backend - Source of page memory
//!
//! Normal pages are fixed-size anonymous mappings. Large pages are sized to
//! their single object, rounded to the system page size. Both come from
//! memmap2 so the code is the same on every platform.
//!
//! Released normal pages are zeroed and kept in a bounded pool for reuse;
//! everything else is unmapped.

use crate::error::{NgcError, Result};
use crate::util::Address;
use indexmap::IndexMap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

/// Size of a normal page
pub const NORMAL_PAGE_SIZE: usize = 128 * 1024;

/// Outcome of handing a page back to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRelease {
    /// Kept for reuse by a later normal page
    Pooled,
    /// Unmapped
    Destroyed,
}

struct BackendState {
    in_use: IndexMap<Address, MmapMut>,
    pool: Vec<MmapMut>,
    pool_limit: usize,
    committed: usize,
}

/// Owns every mapping backing a heap page
pub struct PageBackend {
    state: Mutex<BackendState>,
}

impl PageBackend {
    pub fn new(pool_limit: usize) -> Self {
        Self {
            state: Mutex::new(BackendState {
                in_use: IndexMap::new(),
                pool: Vec::new(),
                pool_limit,
                committed: 0,
            }),
        }
    }

    /// Map (or reuse) a zeroed normal page, returns its base address
    pub fn allocate_normal_page_memory(&self) -> Result<Address> {
        let mut state = self.state.lock();
        let mapping = match state.pool.pop() {
            Some(mapping) => mapping,
            None => {
                let mapping = Self::map(NORMAL_PAGE_SIZE)?;
                state.committed += NORMAL_PAGE_SIZE;
                mapping
            }
        };
        let base = mapping.as_ptr() as Address;
        state.in_use.insert(base, mapping);
        Ok(base)
    }

    /// Map a large page of at least `size` bytes
    ///
    /// Returns the base address and the rounded mapping size.
    pub fn allocate_large_page_memory(&self, size: usize) -> Result<(Address, usize)> {
        let mapped_size = round_to_system_page(size)?;
        let mapping = Self::map(mapped_size)?;
        let base = mapping.as_ptr() as Address;

        let mut state = self.state.lock();
        state.committed += mapped_size;
        state.in_use.insert(base, mapping);
        Ok((base, mapped_size))
    }

    /// Give a normal page back; zeroed and pooled if there is room
    pub fn free_normal_page_memory(&self, base: Address) -> PageRelease {
        let mut state = self.state.lock();
        let Some(mut mapping) = state.in_use.swap_remove(&base) else {
            crate::fatal!("freeing unknown page {:#x}", base);
        };
        if state.pool.len() < state.pool_limit {
            mapping.fill(0);
            state.pool.push(mapping);
            PageRelease::Pooled
        } else {
            state.committed -= mapping.len();
            PageRelease::Destroyed
        }
    }

    pub fn free_large_page_memory(&self, base: Address) -> PageRelease {
        let mut state = self.state.lock();
        match state.in_use.swap_remove(&base) {
            Some(mapping) => {
                state.committed -= mapping.len();
                PageRelease::Destroyed
            }
            None => crate::fatal!("freeing unknown large page {:#x}", base),
        }
    }

    /// Unmap every pooled page
    pub fn discard_pooled_pages(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.pool.len();
        let bytes: usize = state.pool.iter().map(|m| m.len()).sum();
        state.pool.clear();
        state.committed -= bytes;
        discarded
    }

    pub fn pooled_pages(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Bytes currently mapped, including pooled pages
    pub fn committed_bytes(&self) -> usize {
        self.state.lock().committed
    }

    fn map(size: usize) -> Result<MmapMut> {
        MmapOptions::new().len(size).map_anon().map_err(|e| {
            log::warn!("Page mapping of {} bytes failed: {}", size, e);
            NgcError::OutOfMemory {
                requested: size,
                available: 0,
            }
        })
    }
}

fn round_to_system_page(size: usize) -> Result<usize> {
    let page = page_size::get();
    size.checked_add(page - 1)
        .map(|s| s & !(page - 1))
        .ok_or(NgcError::ObjectTooLarge {
            size,
            max: usize::MAX - page,
        })
}

impl std::fmt::Debug for PageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PageBackend")
            .field("in_use", &state.in_use.len())
            .field("pooled", &state.pool.len())
            .field("committed", &state.committed)
            .finish()
    }
}
