//! Spaces - Groups of pages sharing a size class
//!
//! Four normal spaces split small objects by size, one space holds large
//! objects, and embedders may declare extra custom spaces. Each space owns
//! its page list, free list and linear allocation buffer behind one lock.

use crate::config::CustomSpaceConfig;
use crate::heap::free_list::FreeList;
use crate::heap::page::{BasePage, PageId};
use crate::util::Address;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::Arc;

/// Number of built-in spaces
pub const NUMBER_OF_REGULAR_SPACES: usize = 5;

/// Allocated size at or above which objects get their own page
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegularSpaceType {
    /// Allocated size up to 32 bytes
    Normal1,
    /// Up to 64 bytes
    Normal2,
    /// Up to 128 bytes
    Normal3,
    /// Everything below the large-object threshold
    Normal4,
    Large,
}

impl RegularSpaceType {
    pub const ALL: [RegularSpaceType; NUMBER_OF_REGULAR_SPACES] = [
        RegularSpaceType::Normal1,
        RegularSpaceType::Normal2,
        RegularSpaceType::Normal3,
        RegularSpaceType::Normal4,
        RegularSpaceType::Large,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Size class for an allocated size (header included)
    #[inline]
    pub const fn for_size(allocated_size: usize) -> Self {
        if allocated_size >= LARGE_OBJECT_SIZE_THRESHOLD {
            RegularSpaceType::Large
        } else if allocated_size <= 32 {
            RegularSpaceType::Normal1
        } else if allocated_size <= 64 {
            RegularSpaceType::Normal2
        } else if allocated_size <= 128 {
            RegularSpaceType::Normal3
        } else {
            RegularSpaceType::Normal4
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            RegularSpaceType::Normal1 => "normal1",
            RegularSpaceType::Normal2 => "normal2",
            RegularSpaceType::Normal3 => "normal3",
            RegularSpaceType::Normal4 => "normal4",
            RegularSpaceType::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpaceKind {
    Normal,
    Large,
}

/// Bump-pointer region carved from a free block or fresh page
///
/// Memory inside the buffer is zero and has no bitmap bits.
#[derive(Default)]
pub struct LinearAllocationBuffer {
    start: Address,
    size: usize,
    page: Option<Arc<BasePage>>,
}

impl LinearAllocationBuffer {
    #[inline]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn limit(&self) -> Address {
        self.start + self.size
    }

    pub fn page(&self) -> Option<&Arc<BasePage>> {
        self.page.as_ref()
    }

    pub fn set(&mut self, page: Arc<BasePage>, start: Address, size: usize) {
        debug_assert!(start >= page.payload_start() && start + size <= page.payload_end());
        self.start = start;
        self.size = size;
        self.page = Some(page);
    }

    /// Bump `bytes`; caller checked the size
    #[inline]
    pub fn allocate(&mut self, bytes: usize) -> Address {
        debug_assert!(bytes <= self.size);
        let address = self.start;
        self.start += bytes;
        self.size -= bytes;
        address
    }

    /// Move the start back by `bytes`, folding memory just below into the
    /// buffer
    pub fn extend_downwards(&mut self, new_start: Address) {
        debug_assert!(new_start <= self.start);
        self.size += self.start - new_start;
        self.start = new_start;
    }

    /// Forget the buffer and return what was left
    pub fn take(&mut self) -> Option<(Arc<BasePage>, Address, usize)> {
        let page = self.page.take()?;
        let remainder = (page, self.start, self.size);
        self.start = 0;
        self.size = 0;
        Some(remainder)
    }
}

impl std::fmt::Debug for LinearAllocationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocationBuffer")
            .field("start", &crate::util::debug::format_address(self.start))
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct SpaceState {
    pub pages: Vec<PageId>,
    pub free_list: FreeList,
    pub lab: LinearAllocationBuffer,
}

pub struct Space {
    index: usize,
    kind: SpaceKind,
    name: String,
    custom: bool,
    compactable: bool,
    state: Mutex<SpaceState>,
}

impl Space {
    pub(crate) fn regular(kind: RegularSpaceType) -> Self {
        Self {
            index: kind.index(),
            kind: if kind == RegularSpaceType::Large {
                SpaceKind::Large
            } else {
                SpaceKind::Normal
            },
            name: kind.name().to_string(),
            custom: false,
            compactable: false,
            state: Mutex::new(SpaceState {
                free_list: FreeList::new(),
                ..SpaceState::default()
            }),
        }
    }

    pub(crate) fn custom(index: usize, config: &CustomSpaceConfig) -> Self {
        Self {
            index,
            kind: SpaceKind::Normal,
            name: config.name.clone(),
            custom: true,
            compactable: config.compactable,
            state: Mutex::new(SpaceState {
                free_list: FreeList::new(),
                ..SpaceState::default()
            }),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.kind == SpaceKind::Large
    }

    pub fn is_custom(&self) -> bool {
        self.custom
    }

    pub fn is_compactable(&self) -> bool {
        self.compactable
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the space
    ///
    /// Never held across page-table or sweeper calls.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock()
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(RegularSpaceType::for_size(16), RegularSpaceType::Normal1);
        assert_eq!(RegularSpaceType::for_size(32), RegularSpaceType::Normal1);
        assert_eq!(RegularSpaceType::for_size(40), RegularSpaceType::Normal2);
        assert_eq!(RegularSpaceType::for_size(128), RegularSpaceType::Normal3);
        assert_eq!(RegularSpaceType::for_size(136), RegularSpaceType::Normal4);
        assert_eq!(
            RegularSpaceType::for_size(LARGE_OBJECT_SIZE_THRESHOLD - 8),
            RegularSpaceType::Normal4
        );
        assert_eq!(
            RegularSpaceType::for_size(LARGE_OBJECT_SIZE_THRESHOLD),
            RegularSpaceType::Large
        );
    }

    #[test]
    fn test_lab_bump_and_extend() {
        let mut lab = LinearAllocationBuffer::default();
        let page = Arc::new(BasePage::new_normal(0, 0, 0x10_0000));
        lab.set(page, 0x10_0100, 256);

        assert_eq!(lab.allocate(32), 0x10_0100);
        assert_eq!(lab.start(), 0x10_0120);
        assert_eq!(lab.size(), 224);

        lab.extend_downwards(0x10_0100);
        assert_eq!(lab.size(), 256);

        let (_, start, size) = lab.take().unwrap();
        assert_eq!((start, size), (0x10_0100, 256));
        assert!(lab.take().is_none());
    }
}
