//! Object Module - GC-managed object model
//!
//! This module defines the layout of objects managed by NGC and the typed
//! references between them.

pub mod gc_info;
pub mod header;
pub mod member;

pub use gc_info::{GcInfo, GcInfoIndex, GcInfoTable};
pub use header::{HeapObjectHeader, ALLOCATION_GRANULARITY, HEADER_SIZE};
pub use member::{EphemeronPair, GarbageCollected, Member, WeakMember};
