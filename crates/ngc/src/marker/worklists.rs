//! Marking worklists
//!
//! The main marking worklist is a crossbeam [`Injector`] so background
//! markers can steal from it. Everything else is a lock-free [`SegQueue`]
//! that is drained on the mutator.
//!
//! Worklists:
//! - marking: objects marked but not yet traced
//! - not_fully_constructed: objects found while still being constructed
//! - write_barrier: objects marked by the write barrier
//! - concurrent_marking_bailout: objects background markers handed back
//! - weak_callbacks / weak_container_callbacks: post-marking callbacks
//! - discovered_ephemeron_pairs: pairs whose key was not yet live
//! - retrace_marked_objects: weak containers that must be traced strongly

use crate::marker::visitor::{TraceCallback, TraceDescriptor, WeakCallback};
use crate::util::Address;
use crossbeam::queue::SegQueue;
use crossbeam_deque::{Injector, Steal};
use indexmap::IndexSet;
use parking_lot::Mutex;

/// Marked object waiting to be traced
#[derive(Debug, Clone, Copy)]
pub struct MarkingItem {
    pub desc: TraceDescriptor,
}

/// Object whose tracing a background marker deferred to the mutator
#[derive(Clone, Copy)]
pub struct ConcurrentBailoutItem {
    pub parameter: Address,
    pub callback: TraceCallback,
    pub bailedout_size: usize,
}

#[derive(Clone, Copy)]
pub struct WeakCallbackItem {
    pub callback: WeakCallback,
    pub parameter: Address,
}

#[derive(Debug, Clone, Copy)]
pub struct EphemeronPairItem {
    pub key: Address,
    pub value_desc: TraceDescriptor,
}

pub struct MarkingWorklists {
    pub(crate) marking: Injector<MarkingItem>,
    pub(crate) not_fully_constructed: Mutex<IndexSet<Address>>,
    pub(crate) write_barrier: SegQueue<Address>,
    pub(crate) concurrent_marking_bailout: SegQueue<ConcurrentBailoutItem>,
    pub(crate) weak_callbacks: SegQueue<WeakCallbackItem>,
    pub(crate) weak_container_callbacks: SegQueue<WeakCallbackItem>,
    pub(crate) discovered_ephemeron_pairs: SegQueue<EphemeronPairItem>,
    pub(crate) retrace_marked_objects: SegQueue<Address>,
}

impl MarkingWorklists {
    pub fn new() -> Self {
        Self {
            marking: Injector::new(),
            not_fully_constructed: Mutex::new(IndexSet::new()),
            write_barrier: SegQueue::new(),
            concurrent_marking_bailout: SegQueue::new(),
            weak_callbacks: SegQueue::new(),
            weak_container_callbacks: SegQueue::new(),
            discovered_ephemeron_pairs: SegQueue::new(),
            retrace_marked_objects: SegQueue::new(),
        }
    }

    #[inline]
    pub fn push_marking(&self, desc: TraceDescriptor) {
        self.marking.push(MarkingItem { desc });
    }

    /// Pop from the shared marking worklist, retrying on contention
    pub fn pop_marking(&self) -> Option<MarkingItem> {
        loop {
            match self.marking.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Record the header of an object still under construction
    pub fn push_not_fully_constructed(&self, header: Address) {
        self.not_fully_constructed.lock().insert(header);
    }

    pub fn take_not_fully_constructed(&self) -> IndexSet<Address> {
        std::mem::take(&mut *self.not_fully_constructed.lock())
    }

    pub fn marking_is_empty(&self) -> bool {
        self.marking.is_empty()
    }

    /// Worklists that still hold tracing work for the mutator
    pub fn has_mutator_work(&self) -> bool {
        !self.marking.is_empty()
            || !self.write_barrier.is_empty()
            || !self.concurrent_marking_bailout.is_empty()
            || !self.retrace_marked_objects.is_empty()
    }

    /// Everything that must be empty once marking is done
    ///
    /// Weak callbacks and discovered ephemerons are consumed by weak
    /// processing and are not included.
    pub fn is_empty(&self) -> bool {
        !self.has_mutator_work() && self.not_fully_constructed.lock().is_empty()
    }

    pub fn clear_weak_work(&self) {
        while self.weak_callbacks.pop().is_some() {}
        while self.weak_container_callbacks.pop().is_some() {}
        while self.discovered_ephemeron_pairs.pop().is_some() {}
    }

    pub fn clear(&self) {
        while self.pop_marking().is_some() {}
        self.not_fully_constructed.lock().clear();
        while self.write_barrier.pop().is_some() {}
        while self.concurrent_marking_bailout.pop().is_some() {}
        while self.retrace_marked_objects.pop().is_some() {}
        self.clear_weak_work();
    }
}

impl Default for MarkingWorklists {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarkingWorklists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkingWorklists")
            .field("marking", &self.marking.len())
            .field("write_barrier", &self.write_barrier.len())
            .field("bailout", &self.concurrent_marking_bailout.len())
            .field("ephemerons", &self.discovered_ephemeron_pairs.len())
            .finish()
    }
}
