//! GC Info Table - Per-type metadata
//!
//! Every managed type gets one entry holding its trace and finalization
//! callbacks. Object headers store the 16-bit index of that entry, so the
//! collector can trace or finalize an object knowing only its address.
//!
//! Index 0 is reserved for free-list entries and fillers.

use crate::error::{NgcError, Result};
use crate::marker::visitor::{TraceCallback, Visitor};
use crate::object::header::FREE_LIST_GC_INFO_INDEX;
use crate::object::member::GarbageCollected;
use crate::util::Address;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::any::TypeId;

/// Index into the [`GcInfoTable`]
pub type GcInfoIndex = u16;

/// Finalization callback, runs the type's destructor on a payload
pub type FinalizationCallback = unsafe fn(Address);

/// Largest index a header can encode
pub const MAX_GC_INFO_INDEX: usize = u16::MAX as usize;

/// Metadata for one managed type
#[derive(Clone, Copy)]
pub struct GcInfo {
    pub name: &'static str,
    pub trace: TraceCallback,
    pub finalize: Option<FinalizationCallback>,
}

impl GcInfo {
    /// Entry used for slot 0; never traced
    fn free_list_entry() -> Self {
        fn trace_nothing(_: &mut dyn Visitor, _: Address) {}
        Self {
            name: "<free>",
            trace: trace_nothing,
            finalize: None,
        }
    }

    #[inline]
    pub fn has_finalizer(&self) -> bool {
        self.finalize.is_some()
    }
}

impl std::fmt::Debug for GcInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcInfo")
            .field("name", &self.name)
            .field("finalizer", &self.finalize.is_some())
            .finish()
    }
}

/// Registry of [`GcInfo`] entries
///
/// Registration takes the write lock once per type; lookups from markers and
/// the sweeper only take the read lock.
pub struct GcInfoTable {
    infos: RwLock<Vec<GcInfo>>,
    by_type: RwLock<IndexMap<TypeId, GcInfoIndex>>,
}

impl GcInfoTable {
    pub fn new() -> Self {
        Self {
            infos: RwLock::new(vec![GcInfo::free_list_entry()]),
            by_type: RwLock::new(IndexMap::new()),
        }
    }

    /// Index for `T`, registering it on first use
    pub fn index_for<T: GarbageCollected>(&self) -> Result<GcInfoIndex> {
        let type_id = TypeId::of::<T>();
        if let Some(index) = self.by_type.read().get(&type_id) {
            return Ok(*index);
        }

        let mut by_type = self.by_type.write();
        // Another thread may have won the race between the two locks
        if let Some(index) = by_type.get(&type_id) {
            return Ok(*index);
        }
        let index = self.register(GcInfo {
            name: std::any::type_name::<T>(),
            trace: crate::object::member::trace_trampoline::<T>,
            finalize: crate::object::member::finalizer_for::<T>(),
        })?;
        by_type.insert(type_id, index);
        Ok(index)
    }

    /// Append an entry and return its index
    pub fn register(&self, info: GcInfo) -> Result<GcInfoIndex> {
        let mut infos = self.infos.write();
        crate::ensure!(
            infos.len() <= MAX_GC_INFO_INDEX,
            NgcError::Internal(format!("GC info table full ({} entries)", infos.len()))
        );
        let index = infos.len() as GcInfoIndex;
        infos.push(info);
        log::trace!("Registered GC info {} for {}", index, info.name);
        Ok(index)
    }

    /// Entry for `index`
    ///
    /// Indices come from object headers, so an unknown index means heap
    /// corruption.
    #[inline]
    pub fn get(&self, index: GcInfoIndex) -> GcInfo {
        match self.infos.read().get(index as usize) {
            Some(info) => *info,
            None => crate::fatal!("unknown GC info index {}", index),
        }
    }

    /// Run the finalizer of the object at `payload`, if its type has one
    ///
    /// # Safety
    ///
    /// `payload` must be a fully constructed object of the type registered
    /// under `index` that is never accessed again.
    pub unsafe fn finalize(&self, index: GcInfoIndex, payload: Address) -> bool {
        debug_assert_ne!(index, FREE_LIST_GC_INFO_INDEX);
        match self.get(index).finalize {
            Some(finalize) => {
                finalize(payload);
                true
            }
            None => false,
        }
    }

    /// Number of entries including the reserved slot
    pub fn len(&self) -> usize {
        self.infos.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for GcInfoTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::member::Member;

    struct Leaf;
    impl GarbageCollected for Leaf {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }

    struct Node {
        _next: Member<Node>,
        _name: String,
    }
    impl GarbageCollected for Node {
        fn trace(&self, visitor: &mut dyn Visitor) {
            visitor.trace(&self._next);
        }
    }

    #[test]
    fn test_index_zero_is_reserved() {
        let table = GcInfoTable::new();
        let index = table.index_for::<Leaf>().unwrap();
        assert_ne!(index, FREE_LIST_GC_INFO_INDEX);
        assert_eq!(table.get(0).name, "<free>");
    }

    #[test]
    fn test_index_is_stable_per_type() {
        let table = GcInfoTable::new();
        let leaf = table.index_for::<Leaf>().unwrap();
        let node = table.index_for::<Node>().unwrap();

        assert_ne!(leaf, node);
        assert_eq!(table.index_for::<Leaf>().unwrap(), leaf);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_finalizer_only_when_drop_needed() {
        let table = GcInfoTable::new();
        let leaf = table.index_for::<Leaf>().unwrap();
        let node = table.index_for::<Node>().unwrap();

        assert!(!table.get(leaf).has_finalizer());
        assert!(table.get(node).has_finalizer());
    }

    #[test]
    fn test_full_table_rejects_registration() {
        let table = GcInfoTable::new();
        while table.len() <= MAX_GC_INFO_INDEX {
            table.register(GcInfo::free_list_entry()).unwrap();
        }

        assert_eq!(table.len(), MAX_GC_INFO_INDEX + 1);
        assert!(matches!(
            table.register(GcInfo::free_list_entry()),
            Err(NgcError::Internal(_))
        ));
    }
}
