//! Marking State - Per-thread view of the shared worklists
//!
//! Each marking thread owns one `MarkingState`: the mutator during
//! incremental steps and the atomic pause, and every background worker.
//! Marked bytes are counted locally and summed once marking ends.
//!
//! # Accounting
//!
//! Bytes are accounted when an object is popped for tracing, not when it is
//! marked. A background marker that defers an object to the mutator
//! subtracts the bytes again; the mutator re-adds them when it traces the
//! deferred object.

use crate::marker::visitor::{TraceCallback, TraceDescriptor, WeakCallback};
use crate::marker::worklists::{ConcurrentBailoutItem, EphemeronPairItem, MarkingWorklists, WeakCallbackItem};
use crate::object::header::HeapObjectHeader;
use crate::util::Address;
use indexmap::IndexSet;
use std::sync::Arc;

pub struct MarkingState {
    worklists: Arc<MarkingWorklists>,
    marked_bytes: usize,
    marked_objects: usize,
    movable_references: usize,
    recently_retraced: IndexSet<Address>,
}

impl MarkingState {
    pub fn new(worklists: Arc<MarkingWorklists>) -> Self {
        Self {
            worklists,
            marked_bytes: 0,
            marked_objects: 0,
            movable_references: 0,
            recently_retraced: IndexSet::new(),
        }
    }

    #[inline]
    pub fn worklists(&self) -> &Arc<MarkingWorklists> {
        &self.worklists
    }

    #[inline]
    fn header<'a>(payload: Address) -> &'a HeapObjectHeader {
        // SAFETY: descriptors are only built from payloads of heap objects.
        unsafe { HeapObjectHeader::from_payload(payload) }
    }

    /// Set the mark bit; true if this call marked the object
    #[inline]
    pub fn mark_no_push(&mut self, header: &HeapObjectHeader) -> bool {
        debug_assert!(!header.is_free());
        if header.try_mark_atomic() {
            self.marked_objects += 1;
            true
        } else {
            false
        }
    }

    /// Mark the object and queue it for tracing
    ///
    /// Objects under construction cannot be traced yet and go to the
    /// not-fully-constructed set instead.
    pub fn mark_and_push(&mut self, desc: TraceDescriptor) {
        let header = Self::header(desc.base_object_payload);
        if header.is_in_construction() {
            self.worklists.push_not_fully_constructed(header.address());
            return;
        }
        if self.mark_no_push(header) {
            self.worklists.push_marking(desc);
        }
    }

    #[inline]
    pub fn account_marked_bytes(&mut self, bytes: usize) {
        self.marked_bytes += bytes;
    }

    /// Undo accounting for an object handed to another thread
    #[inline]
    pub fn account_deferred_marked_bytes(&mut self, bytes: usize) {
        self.marked_bytes = self.marked_bytes.saturating_sub(bytes);
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    /// Number of objects this state marked
    pub fn marked_objects(&self) -> usize {
        self.marked_objects
    }

    pub fn movable_references(&self) -> usize {
        self.movable_references
    }

    /// Register a weak callback unless the target is already known live
    ///
    /// A target set later is kept alive by the write barrier, so skipping
    /// the callback is safe.
    pub fn register_weak_reference_if_needed(
        &mut self,
        desc: TraceDescriptor,
        callback: WeakCallback,
        parameter: Address,
    ) {
        let header = Self::header(desc.base_object_payload);
        if !header.is_in_construction() && header.is_marked() {
            return;
        }
        self.register_weak_callback(callback, parameter);
    }

    pub fn register_weak_callback(&mut self, callback: WeakCallback, parameter: Address) {
        self.worklists
            .weak_callbacks
            .push(WeakCallbackItem { callback, parameter });
    }

    /// Trace the value if the key is live, otherwise park the pair
    pub fn process_ephemeron(&mut self, key: Address, value_desc: TraceDescriptor) {
        let key_header = Self::header(key);
        // A key under construction is reachable from its constructor
        let key_is_live = key_header.is_in_construction() || key_header.is_marked();
        if key_is_live {
            self.mark_and_push(value_desc);
        } else {
            self.worklists
                .discovered_ephemeron_pairs
                .push(EphemeronPairItem { key, value_desc });
        }
    }

    /// Mark a weak container without tracing its entries strongly
    pub fn process_weak_container(
        &mut self,
        container: Address,
        weak_desc: Option<TraceDescriptor>,
        callback: WeakCallback,
        parameter: Address,
    ) {
        let header = Self::header(container);
        if header.is_in_construction() {
            self.worklists.push_not_fully_constructed(header.address());
            return;
        }
        header.set_weak_container_marked();
        if !self.mark_no_push(header) {
            return;
        }
        self.worklists
            .weak_container_callbacks
            .push(WeakCallbackItem { callback, parameter });
        match weak_desc {
            Some(desc) => self.worklists.push_marking(desc),
            None => self.account_marked_bytes(header.allocated_size()),
        }
    }

    /// Queue an already marked weak container for strong re-tracing
    pub fn re_trace_marked_weak_container(&mut self, header: &HeapObjectHeader) {
        debug_assert!(header.is_marked());
        if self.recently_retraced.insert(header.address()) {
            self.worklists.retrace_marked_objects.push(header.address());
        }
    }

    /// Hand an object back to the mutator for tracing
    pub fn defer_to_mutator(&mut self, parameter: Address, callback: TraceCallback, size: usize) {
        self.worklists
            .concurrent_marking_bailout
            .push(ConcurrentBailoutItem {
                parameter,
                callback,
                bailedout_size: size,
            });
        self.account_deferred_marked_bytes(size);
    }

    pub fn register_movable_reference(&mut self, _slot: Address) {
        self.movable_references += 1;
    }
}

impl std::fmt::Debug for MarkingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkingState")
            .field("marked_bytes", &self.marked_bytes)
            .field("marked_objects", &self.marked_objects)
            .finish()
    }
}
