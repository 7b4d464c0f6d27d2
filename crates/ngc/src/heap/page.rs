//! Pages - Units of heap memory
//!
//! A normal page is a [`NORMAL_PAGE_SIZE`] mapping holding many objects of
//! one space, with an [`ObjectStartBitmap`] for inner-pointer lookups. A
//! large page holds exactly one object.
//!
//! Page metadata lives outside the mapping so the whole normal page is
//! payload.
//!
//! Large page layout:
//! ```text
//! base        base + 8        base + 16
//! │ unused    │ header        │ payload ...
//! ```
//! The 8-byte offset keeps large payloads 16-byte aligned.

use crate::heap::object_start_bitmap::ObjectStartBitmap;
use crate::heap::page_backend::NORMAL_PAGE_SIZE;
use crate::object::header::HeapObjectHeader;
use crate::util::Address;

/// Page table slot
pub type PageId = usize;

/// Offset of the object header inside a large page
pub const LARGE_PAGE_HEADER_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Normal,
    Large,
}

pub struct BasePage {
    id: PageId,
    space: usize,
    kind: PageKind,
    base: Address,
    size: usize,
    payload_start: Address,
    payload_end: Address,
    bitmap: Option<ObjectStartBitmap>,
}

impl BasePage {
    pub(crate) fn new_normal(id: PageId, space: usize, base: Address) -> Self {
        Self {
            id,
            space,
            kind: PageKind::Normal,
            base,
            size: NORMAL_PAGE_SIZE,
            payload_start: base,
            payload_end: base + NORMAL_PAGE_SIZE,
            bitmap: Some(ObjectStartBitmap::new(base, NORMAL_PAGE_SIZE)),
        }
    }

    /// Large page whose header sits at `base + LARGE_PAGE_HEADER_OFFSET`
    pub(crate) fn new_large(
        id: PageId,
        space: usize,
        base: Address,
        mapped_size: usize,
        allocated_size: usize,
    ) -> Self {
        let payload_start = base + LARGE_PAGE_HEADER_OFFSET;
        debug_assert!(payload_start + allocated_size <= base + mapped_size);
        Self {
            id,
            space,
            kind: PageKind::Large,
            base,
            size: mapped_size,
            payload_start,
            payload_end: payload_start + allocated_size,
            bitmap: None,
        }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Index of the owning space
    #[inline]
    pub fn space_index(&self) -> usize {
        self.space
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }

    #[inline]
    pub fn base(&self) -> Address {
        self.base
    }

    /// Mapped size
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// First header address
    #[inline]
    pub fn payload_start(&self) -> Address {
        self.payload_start
    }

    #[inline]
    pub fn payload_end(&self) -> Address {
        self.payload_end
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload_end - self.payload_start
    }

    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// Bitmap of a normal page
    #[inline]
    pub fn object_start_bitmap(&self) -> &ObjectStartBitmap {
        match &self.bitmap {
            Some(bitmap) => bitmap,
            None => crate::fatal!("large page {} has no object start bitmap", self.id),
        }
    }

    /// The single object of a large page
    #[inline]
    pub fn large_object_header(&self) -> &HeapObjectHeader {
        debug_assert!(self.is_large());
        // SAFETY: large pages are initialized with a header at payload_start.
        unsafe { HeapObjectHeader::at(self.payload_start) }
    }

    /// Object containing `address`, if any
    ///
    /// Free blocks and unused linear-allocation space yield `None`.
    pub fn find_object_header(&self, address: Address) -> Option<&HeapObjectHeader> {
        if address < self.payload_start || address >= self.payload_end {
            return None;
        }
        let header = match &self.bitmap {
            None => self.large_object_header(),
            Some(bitmap) => {
                let start = bitmap.find_header(address)?;
                // SAFETY: bitmap bits are only set at header addresses.
                unsafe { HeapObjectHeader::at(start) }
            }
        };
        if header.is_free() || address >= header.object_end() {
            return None;
        }
        Some(header)
    }

    /// Visit every header recorded in the bitmap, including free blocks
    pub fn iterate_headers(&self, mut f: impl FnMut(&HeapObjectHeader)) {
        match &self.bitmap {
            None => f(self.large_object_header()),
            Some(bitmap) => bitmap.iterate(|address| {
                // SAFETY: bitmap bits are only set at header addresses.
                f(unsafe { HeapObjectHeader::at(address) })
            }),
        }
    }

    /// Walk headers linearly from the payload start
    ///
    /// # Safety
    ///
    /// The page must be fully walkable: no active linear allocation buffer
    /// and no concurrent writers.
    pub unsafe fn walk(&self, mut f: impl FnMut(&HeapObjectHeader)) {
        let mut address = self.payload_start;
        while address < self.payload_end {
            let header = HeapObjectHeader::at(address);
            let size = header.allocated_size();
            if size == 0 {
                crate::fatal!(
                    "unwalkable page {} at {:#x}",
                    self.id,
                    address
                );
            }
            f(header);
            address += size;
        }
    }
}

impl std::fmt::Debug for BasePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasePage")
            .field("id", &self.id)
            .field("space", &self.space)
            .field("kind", &self.kind)
            .field("base", &crate::util::debug::format_address(self.base))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::FREE_LIST_GC_INFO_INDEX;

    #[repr(align(16))]
    struct Arena([u8; NORMAL_PAGE_SIZE]);

    fn normal_page() -> (Box<Arena>, BasePage) {
        let mut memory = Box::new(Arena([0; NORMAL_PAGE_SIZE]));
        let base = memory.0.as_mut_ptr() as Address;
        (memory, BasePage::new_normal(0, 0, base))
    }

    #[test]
    fn test_find_object_header_for_inner_pointer() {
        let (_memory, page) = normal_page();
        let base = page.base();
        unsafe {
            HeapObjectHeader::initialize(base, 32, 1);
            HeapObjectHeader::initialize(base + 32, 64, 2);
        }
        page.object_start_bitmap().set_bit(base);
        page.object_start_bitmap().set_bit(base + 32);

        let found = page.find_object_header(base + 40).unwrap();
        assert_eq!(found.address(), base + 32);
        assert_eq!(page.find_object_header(base + 31).unwrap().address(), base);

        // Past the last object is unused space
        assert!(page.find_object_header(base + 96).is_none());
    }

    #[test]
    fn test_find_object_header_ignores_free_blocks() {
        let (_memory, page) = normal_page();
        let base = page.base();
        unsafe { HeapObjectHeader::initialize(base, 128, FREE_LIST_GC_INFO_INDEX) };
        page.object_start_bitmap().set_bit(base);

        assert!(page.find_object_header(base + 16).is_none());
    }

    #[test]
    fn test_walk_visits_every_block() {
        let (_memory, page) = normal_page();
        let base = page.base();
        unsafe {
            HeapObjectHeader::initialize(base, 64, 1);
            HeapObjectHeader::initialize(base + 64, NORMAL_PAGE_SIZE - 64, FREE_LIST_GC_INFO_INDEX);
        }

        let mut sizes = Vec::new();
        unsafe { page.walk(|header| sizes.push(header.allocated_size())) };
        assert_eq!(sizes, vec![64, NORMAL_PAGE_SIZE - 64]);
    }
}
