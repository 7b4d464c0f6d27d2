//! # NGC - Embeddable Tracing Garbage Collector
//!
//! NGC is the memory-management core of a non-moving, mark-sweep garbage
//! collector meant to be embedded in a host runtime. The host owns the
//! threads and the event loop; NGC owns the heap.
//!
//! ## Overview
//!
//! - **Size-class spaces**: Small objects are bump-allocated from linear
//!   allocation buffers on 128 KiB pages, large objects get their own page
//! - **Atomic, incremental or concurrent marking**: Tri-color marking with
//!   an insertion write barrier, ephemerons and weak processing
//! - **Atomic, lazy or concurrent sweeping**: Finalizers always run on the
//!   mutator thread
//! - **Heap growing**: Collections are triggered from allocation once the
//!   live size grows past a limit derived from the last marking
//! - **Explicit management**: Unreferenced objects can be freed or resized
//!   in place before the next collection
//!
//! ## Quick Start
//!
//! ```rust
//! use ngc::{DefaultPlatform, GarbageCollected, GcConfig, Heap, HeapConfig, Member, Visitor};
//! use std::sync::Arc;
//!
//! struct Node {
//!     value: u64,
//!     next: Member<Node>,
//! }
//!
//! impl GarbageCollected for Node {
//!     fn trace(&self, visitor: &mut dyn Visitor) {
//!         visitor.trace(&self.next);
//!     }
//! }
//!
//! fn main() -> Result<(), ngc::NgcError> {
//!     let heap = Heap::new(HeapConfig::default(), Arc::new(DefaultPlatform::new()))?;
//!
//!     let tail = heap.make_garbage_collected(Node { value: 2, next: Member::null() })?;
//!     let head = heap.make_garbage_collected(Node { value: 1, next: Member::new(Some(tail)) })?;
//!
//!     // Persistents are the roots of the object graph
//!     let root = heap.persistent(Some(head));
//!
//!     heap.collect_garbage(GcConfig::precise_atomic());
//!     let head = unsafe { root.as_ref() }.unwrap();
//!     assert_eq!(head.value, 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                          Heap                             │
//! │                                                           │
//! │  ObjectAllocator ──► StatsCollector ──► HeapGrowing       │
//! │        │                   │                 │            │
//! │        │                   │                 ▼            │
//! │        │                   │            GcInvoker ──► Platform
//! │        ▼                   ▼                 │            │
//! │     RawHeap ◄──────── Sweeper ◄──────── Marker            │
//! │  (spaces, pages,                       (worklists,        │
//! │   free lists, LABs)                     roots, stack)     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Safety
//!
//! NGC hands out raw `NonNull` pointers. Embedders must follow these rules:
//!
//! 1. **Keep objects reachable**: An object not reachable from a
//!    [`Persistent`], another live object, an object under construction or
//!    (for conservative collections) the stack may be reclaimed
//! 2. **Use the write barrier**: While marking, stores into heap objects go
//!    through [`Heap::assign`] or [`Heap::write_barrier`]
//! 3. **No allocation in finalizers**: Allocation fails inside finalizers
//! 4. **Free only unreferenced objects**: [`Heap::free_unreferenced_object`]
//!    trusts the caller
//!
//! ## Modules
//!
//! - [`allocator`]: Object allocation on top of the raw heap
//! - [`config`]: Heap and collection configuration
//! - [`error`]: Error types
//! - [`explicit`]: Explicit free and in-place resize
//! - [`gc`]: Heap and collection cycle management
//! - [`heap`]: Pages, spaces, free lists and the page backend
//! - [`heap_growing`]: Allocation-driven collection triggering
//! - [`invoker`]: Deferral of collections the platform cannot run now
//! - [`logging`]: Structured GC events
//! - [`marker`]: Marking, roots and the visitor interface
//! - [`object`]: Object headers, GC info and member references
//! - [`platform`]: Task runner and job abstractions of the host
//! - [`prefinalizer`]: Callbacks for dead objects that run before sweeping
//! - [`stats`]: Allocation accounting and heap statistics
//! - [`sweeper`]: Sweeping and finalization
//! - [`util`]: Utility functions and helpers

// Core GC modules
pub mod config;
pub mod error;
pub mod gc;

// Memory management subsystems
pub mod allocator;
pub mod explicit;
pub mod heap;
pub mod object;

// GC algorithm components
pub mod heap_growing;
pub mod invoker;
pub mod marker;
pub mod sweeper;

// Host integration and monitoring
pub mod logging;
pub mod platform;
pub mod prefinalizer;
pub mod stats;

// Utilities
pub mod util;

// Re-export main types for convenience
pub use allocator::UnconstructedObject;
pub use config::{
    CollectionType, CustomSpaceConfig, GcConfig, GrowingPolicy, HeapConfig, MarkingType, StackState,
    SweepingType,
};
pub use error::{NgcError, Result};
pub use gc::{GarbageCollector, GcPhase, Heap, HeapFlags, NoGarbageCollectionScope};
pub use marker::{
    CrossThreadPersistent, LivenessBroker, NativeStackScanner, Persistent, StackScanner, Visitor,
    WeakCrossThreadPersistent, WeakPersistent,
};
pub use object::{EphemeronPair, GarbageCollected, Member, WeakMember};
pub use platform::{DefaultPlatform, Platform, TaskRunner};
pub use stats::{HeapStatistics, PageStatistics};
pub use sweeper::SweepingObserver;

/// NGC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a heap with default configuration on the default platform
///
/// # Examples
///
/// ```rust
/// let heap = ngc::init()?;
/// assert_eq!(heap.epoch(), 0);
/// # Ok::<(), ngc::NgcError>(())
/// ```
pub fn init() -> Result<std::sync::Arc<Heap>> {
    init_with_config(HeapConfig::default())
}

/// Create a heap with `config` on the default platform
pub fn init_with_config(config: HeapConfig) -> Result<std::sync::Arc<Heap>> {
    Heap::new(config, std::sync::Arc::new(DefaultPlatform::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        let result = init();
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = HeapConfig {
            concurrent_sweeping_threads: 0,
            ..HeapConfig::default()
        };
        assert!(matches!(init_with_config(config), Err(NgcError::Configuration(_))));
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
