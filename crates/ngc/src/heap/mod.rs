//! Heap Management Module - Spaces, pages and the page table
//!
//! The raw heap owns every page of a managed heap. Pages are grouped into
//! spaces by size class:
//! - Normal1..Normal4: objects up to 32, 64, 128 bytes and below 64 KiB
//! - Large: one object per page
//! - Custom spaces declared in the heap configuration (normal pages)
//!
//! Page Lifecycle:
//! 1. Allocated - mapped by the backend and registered in the page table
//! 2. In use - objects are carved from its free blocks
//! 3. Released - swept empty (or explicitly freed, for large pages) and
//!    returned to the backend, which pools or unmaps it
//!
//! Heap Structure:
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      RawHeap                         │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │ Normal1 │ │ Normal2 │ │   ...   │ │   Large    │  │
//! │  │ pages   │ │ pages   │ │         │ │ pages      │  │
//! │  └─────────┘ └─────────┘ └─────────┘ └────────────┘  │
//! │              page table: address -> page             │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order: space, then page table, then backend.

pub mod free_list;
pub mod object_start_bitmap;
pub mod page;
pub mod page_backend;
pub mod space;

pub use free_list::FreeList;
pub use object_start_bitmap::ObjectStartBitmap;
pub use page::{BasePage, PageId, PageKind, LARGE_PAGE_HEADER_OFFSET};
pub use page_backend::{PageBackend, PageRelease, NORMAL_PAGE_SIZE};
pub use space::{
    LinearAllocationBuffer, RegularSpaceType, Space, SpaceKind, SpaceState,
    LARGE_OBJECT_SIZE_THRESHOLD, NUMBER_OF_REGULAR_SPACES,
};

use crate::config::CustomSpaceConfig;
use crate::error::Result;
use crate::object::header::{HeapObjectHeader, HEADER_SIZE};
use crate::util::Address;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
struct PageTable {
    slots: Vec<Option<Arc<BasePage>>>,
    free_slots: Vec<PageId>,
    by_address: BTreeMap<Address, PageId>,
}

impl PageTable {
    fn next_id(&mut self) -> PageId {
        match self.free_slots.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    fn insert(&mut self, page: Arc<BasePage>) {
        let id = page.id();
        self.by_address.insert(page.base(), id);
        self.slots[id] = Some(page);
    }

    fn remove(&mut self, page: &BasePage) {
        self.by_address.remove(&page.base());
        self.slots[page.id()] = None;
        self.free_slots.push(page.id());
    }

    fn lookup(&self, address: Address) -> Option<&Arc<BasePage>> {
        let (_, id) = self.by_address.range(..=address).next_back()?;
        let page = self.slots[*id].as_ref()?;
        page.contains(address).then_some(page)
    }
}

/// All spaces and pages of one heap
pub struct RawHeap {
    spaces: Vec<Space>,
    page_table: RwLock<PageTable>,
    backend: PageBackend,
}

impl RawHeap {
    pub fn new(custom_spaces: &[CustomSpaceConfig], page_pool_limit: usize) -> Self {
        let mut spaces: Vec<Space> = RegularSpaceType::ALL
            .iter()
            .map(|kind| Space::regular(*kind))
            .collect();
        for (offset, config) in custom_spaces.iter().enumerate() {
            spaces.push(Space::custom(NUMBER_OF_REGULAR_SPACES + offset, config));
        }
        Self {
            spaces,
            page_table: RwLock::new(PageTable::default()),
            backend: PageBackend::new(page_pool_limit),
        }
    }

    pub fn spaces(&self) -> &[Space] {
        &self.spaces
    }

    #[inline]
    pub fn space(&self, index: usize) -> &Space {
        &self.spaces[index]
    }

    #[inline]
    pub fn regular_space(&self, kind: RegularSpaceType) -> &Space {
        &self.spaces[kind.index()]
    }

    /// Custom space by its index among custom spaces
    pub fn custom_space(&self, custom_index: usize) -> Option<&Space> {
        self.spaces.get(NUMBER_OF_REGULAR_SPACES + custom_index)
    }

    pub fn custom_space_count(&self) -> usize {
        self.spaces.len() - NUMBER_OF_REGULAR_SPACES
    }

    pub fn backend(&self) -> &PageBackend {
        &self.backend
    }

    /// Map a zeroed normal page for `space` and register it
    ///
    /// The caller adds the page to the space's page list.
    pub fn allocate_normal_page(&self, space: &Space) -> Result<Arc<BasePage>> {
        debug_assert!(!space.is_large());
        let base = self.backend.allocate_normal_page_memory()?;
        let mut table = self.page_table.write();
        let page = Arc::new(BasePage::new_normal(table.next_id(), space.index(), base));
        table.insert(page.clone());
        log::trace!("Allocated normal page {} in {}", page.id(), space.name());
        Ok(page)
    }

    /// Map a large page for one object of `allocated_size` bytes
    ///
    /// The header is not written; the caller adds the page to the space.
    pub fn allocate_large_page(&self, space: &Space, allocated_size: usize) -> Result<Arc<BasePage>> {
        debug_assert!(space.is_large());
        let (base, mapped_size) = self
            .backend
            .allocate_large_page_memory(LARGE_PAGE_HEADER_OFFSET + allocated_size)?;
        let mut table = self.page_table.write();
        let page = Arc::new(BasePage::new_large(
            table.next_id(),
            space.index(),
            base,
            mapped_size,
            allocated_size,
        ));
        table.insert(page.clone());
        log::trace!("Allocated large page {} ({} bytes)", page.id(), mapped_size);
        Ok(page)
    }

    /// Unlink `page` from its space and the page table, then return its
    /// memory to the backend
    ///
    /// The caller must not hold the space lock.
    pub fn release_page(&self, page: &BasePage) -> PageRelease {
        {
            let mut state = self.space(page.space_index()).lock();
            state.pages.retain(|id| *id != page.id());
        }
        self.page_table.write().remove(page);
        let release = if page.is_large() {
            self.backend.free_large_page_memory(page.base())
        } else {
            self.backend.free_normal_page_memory(page.base())
        };
        log::trace!("Released page {} ({:?})", page.id(), release);
        release
    }

    /// Page containing `address`
    pub fn lookup_page(&self, address: Address) -> Option<Arc<BasePage>> {
        self.page_table.read().lookup(address).cloned()
    }

    pub fn page(&self, id: PageId) -> Option<Arc<BasePage>> {
        self.page_table.read().slots.get(id).cloned().flatten()
    }

    /// Snapshot of the pages of `space`
    pub fn pages_of(&self, space: &Space) -> Vec<Arc<BasePage>> {
        let ids = space.lock().pages.clone();
        let table = self.page_table.read();
        ids.iter()
            .filter_map(|id| table.slots.get(*id).cloned().flatten())
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.page_table.read().by_address.len()
    }

    /// Header of the live or dead object containing `address`
    ///
    /// Free blocks, unused buffer space and non-heap addresses yield `None`.
    pub fn find_object_header(&self, address: Address) -> Option<&HeapObjectHeader> {
        let page = self.lookup_page(address)?;
        let header = page.find_object_header(address)?;
        // SAFETY: the page stays mapped while the caller holds the heap; the
        // header lifetime is tied to `self`, not to the Arc clone.
        Some(unsafe { HeapObjectHeader::at(header.address()) })
    }

    /// Whether `payload` is the payload start of a heap object
    pub fn is_object_payload(&self, payload: Address) -> bool {
        self.find_object_header(payload)
            .is_some_and(|header| header.address() + HEADER_SIZE == payload)
    }

    /// Turn every linear allocation buffer back into a free block
    ///
    /// Called before sweeping so pages become walkable.
    pub fn reset_linear_allocation_buffers(&self) {
        for space in self.spaces.iter().filter(|s| !s.is_large()) {
            let mut state = space.lock();
            Self::return_lab_to_free_list(&mut state);
        }
    }

    /// Give the remainder of the space's buffer to its free list
    pub(crate) fn return_lab_to_free_list(state: &mut SpaceState) {
        if let Some((page, start, size)) = state.lab.take() {
            if size > 0 {
                // SAFETY: buffer memory is zero and owned by this space.
                unsafe { state.free_list.add(start, size) };
                page.object_start_bitmap().set_bit(start);
            }
        }
    }
}

impl std::fmt::Debug for RawHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawHeap")
            .field("spaces", &self.spaces.len())
            .field("pages", &self.page_count())
            .field("backend", &self.backend)
            .finish()
    }
}
