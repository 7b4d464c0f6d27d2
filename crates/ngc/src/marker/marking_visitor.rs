//! Marking Visitors
//!
//! - [`MarkingVisitor`]: precise tracing on the mutator or on a background
//!   marker. The background flavour hands objects that cannot be traced
//!   concurrently back to the mutator.
//! - [`ConservativeMarkingVisitor`]: treats arbitrary words as potential
//!   pointers. Used for the stack and for objects still under construction.

use crate::heap::RawHeap;
use crate::marker::marking_state::MarkingState;
use crate::marker::visitor::{TraceCallback, TraceDescriptor, Visitor, WeakCallback};
use crate::object::gc_info::GcInfoTable;
use crate::object::header::HeapObjectHeader;
use crate::util::Address;
use std::mem::size_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitorThread {
    Mutator,
    Concurrent,
}

pub struct MarkingVisitor<'a> {
    state: &'a mut MarkingState,
    thread: VisitorThread,
}

impl<'a> MarkingVisitor<'a> {
    pub fn mutator(state: &'a mut MarkingState) -> Self {
        Self {
            state,
            thread: VisitorThread::Mutator,
        }
    }

    pub fn concurrent(state: &'a mut MarkingState) -> Self {
        Self {
            state,
            thread: VisitorThread::Concurrent,
        }
    }

    pub fn state(&mut self) -> &mut MarkingState {
        self.state
    }
}

impl Visitor for MarkingVisitor<'_> {
    fn visit(&mut self, desc: TraceDescriptor) {
        self.state.mark_and_push(desc);
    }

    fn visit_weak(&mut self, desc: TraceDescriptor, callback: WeakCallback, parameter: Address) {
        self.state
            .register_weak_reference_if_needed(desc, callback, parameter);
    }

    fn visit_ephemeron(&mut self, key: Address, value_desc: TraceDescriptor) {
        self.state.process_ephemeron(key, value_desc);
    }

    fn visit_weak_container(
        &mut self,
        strong_desc: TraceDescriptor,
        weak_desc: Option<TraceDescriptor>,
        callback: WeakCallback,
        parameter: Address,
    ) {
        self.state.process_weak_container(
            strong_desc.base_object_payload,
            weak_desc,
            callback,
            parameter,
        );
    }

    fn register_weak_callback(&mut self, callback: WeakCallback, parameter: Address) {
        self.state.register_weak_callback(callback, parameter);
    }

    fn register_movable_reference(&mut self, slot: Address) {
        self.state.register_movable_reference(slot);
    }

    fn defer_trace_to_mutator_thread_if_concurrent(
        &mut self,
        parameter: Address,
        callback: TraceCallback,
        deferred_size: usize,
    ) -> bool {
        if self.thread == VisitorThread::Mutator {
            return false;
        }
        self.state.defer_to_mutator(parameter, callback, deferred_size);
        true
    }
}

/// Visitor for words that may or may not be heap pointers
///
/// Only runs on the mutator, inside the atomic pause.
pub struct ConservativeMarkingVisitor<'a> {
    state: &'a mut MarkingState,
    raw_heap: &'a RawHeap,
    gc_info: &'a GcInfoTable,
}

impl<'a> ConservativeMarkingVisitor<'a> {
    pub fn new(state: &'a mut MarkingState, raw_heap: &'a RawHeap, gc_info: &'a GcInfoTable) -> Self {
        Self {
            state,
            raw_heap,
            gc_info,
        }
    }

    /// Mark whatever object `address` points into, if any
    pub fn trace_conservatively_if_needed(&mut self, address: Address) {
        if let Some(header) = self.raw_heap.find_object_header(address) {
            self.trace_header_conservatively(header);
        }
    }

    pub fn trace_header_conservatively(&mut self, header: &HeapObjectHeader) {
        if header.is_in_construction() {
            self.visit_in_construction_conservatively(header);
        } else {
            self.visit_fully_constructed_conservatively(header);
        }
    }

    fn visit_fully_constructed_conservatively(&mut self, header: &HeapObjectHeader) {
        if header.is_marked() {
            // Weak containers are held strongly when found on the stack
            if header.is_weak_container_marked() {
                self.state.re_trace_marked_weak_container(header);
            }
            return;
        }
        let info = self.gc_info.get(header.gc_info_index());
        self.state.mark_and_push(TraceDescriptor {
            base_object_payload: header.payload(),
            callback: info.trace,
        });
    }

    fn visit_in_construction_conservatively(&mut self, header: &HeapObjectHeader) {
        if !self.state.mark_no_push(header) {
            return;
        }
        self.state.account_marked_bytes(header.allocated_size());
        self.trace_payload_conservatively(header);
    }

    /// Scan every word of the payload
    fn trace_payload_conservatively(&mut self, header: &HeapObjectHeader) {
        let mut slot = header.payload();
        let end = header.object_end();
        while slot + size_of::<usize>() <= end {
            // SAFETY: the slot lies inside a live allocation; the object may
            // be written concurrently by its constructor, hence volatile.
            let word = unsafe { std::ptr::read_volatile(slot as *const usize) };
            self.trace_conservatively_if_needed(word);
            slot += size_of::<usize>();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::worklists::MarkingWorklists;
    use std::sync::Arc;

    const SIZE: usize = 32;

    fn noop(_: &mut dyn Visitor, _: Address) {}

    fn on_mutator(_: &mut dyn Visitor, _: Address) {}

    fn ignore(_: &crate::marker::visitor::LivenessBroker, _: Address) {}

    /// Backing storage for a few fake objects
    struct Objects {
        buffer: Vec<u64>,
    }

    impl Objects {
        fn new(count: usize) -> Self {
            Self {
                buffer: vec![0; count * SIZE / 8],
            }
        }

        fn init(&mut self, i: usize, constructed: bool) -> Address {
            let addr = self.buffer.as_mut_ptr() as Address + i * SIZE;
            let header = unsafe { HeapObjectHeader::initialize(addr, SIZE, 1) };
            if constructed {
                header.mark_as_fully_constructed();
            }
            header.payload()
        }
    }

    fn desc(payload: Address) -> TraceDescriptor {
        TraceDescriptor {
            base_object_payload: payload,
            callback: noop,
        }
    }

    #[test]
    fn test_visit_marks_once() {
        let mut objects = Objects::new(1);
        let payload = objects.init(0, true);
        let worklists = Arc::new(MarkingWorklists::new());
        let mut state = MarkingState::new(worklists.clone());

        {
            let mut visitor = MarkingVisitor::mutator(&mut state);
            visitor.visit(desc(payload));
            visitor.visit(desc(payload));
        }

        assert!(unsafe { HeapObjectHeader::from_payload(payload) }.is_marked());
        assert_eq!(state.marked_objects(), 1);
        assert!(worklists.pop_marking().is_some());
        assert!(worklists.pop_marking().is_none());
    }

    #[test]
    fn test_in_construction_goes_to_not_fully_constructed() {
        let mut objects = Objects::new(1);
        let payload = objects.init(0, false);
        let worklists = Arc::new(MarkingWorklists::new());
        let mut state = MarkingState::new(worklists.clone());

        MarkingVisitor::mutator(&mut state).visit(desc(payload));

        assert!(!unsafe { HeapObjectHeader::from_payload(payload) }.is_marked());
        assert!(worklists.marking_is_empty());
        assert_eq!(worklists.take_not_fully_constructed().len(), 1);
    }

    #[test]
    fn test_weak_reference_to_marked_object_needs_no_callback() {
        let mut objects = Objects::new(2);
        let live = objects.init(0, true);
        let unknown = objects.init(1, true);
        let worklists = Arc::new(MarkingWorklists::new());
        let mut state = MarkingState::new(worklists.clone());

        let mut visitor = MarkingVisitor::mutator(&mut state);
        visitor.visit(desc(live));
        visitor.visit_weak(desc(live), ignore, 0);
        visitor.visit_weak(desc(unknown), ignore, 0);

        assert_eq!(worklists.weak_callbacks.len(), 1);
    }

    #[test]
    fn test_ephemeron_value_waits_for_key() {
        let mut objects = Objects::new(2);
        let key = objects.init(0, true);
        let value = objects.init(1, true);
        let worklists = Arc::new(MarkingWorklists::new());
        let mut state = MarkingState::new(worklists.clone());

        MarkingVisitor::mutator(&mut state).visit_ephemeron(key, desc(value));
        assert_eq!(worklists.discovered_ephemeron_pairs.len(), 1);
        assert!(!unsafe { HeapObjectHeader::from_payload(value) }.is_marked());

        let mut visitor = MarkingVisitor::mutator(&mut state);
        visitor.visit(desc(key));
        visitor.visit_ephemeron(key, desc(value));
        assert!(unsafe { HeapObjectHeader::from_payload(value) }.is_marked());
    }

    #[test]
    fn test_concurrent_visitor_defers_and_unaccounts() {
        let worklists = Arc::new(MarkingWorklists::new());
        let mut state = MarkingState::new(worklists.clone());
        state.account_marked_bytes(SIZE);

        let deferred = MarkingVisitor::concurrent(&mut state)
            .defer_trace_to_mutator_thread_if_concurrent(64, on_mutator, SIZE);
        assert!(deferred);
        assert_eq!(state.marked_bytes(), 0);
        assert_eq!(worklists.concurrent_marking_bailout.len(), 1);

        let deferred = MarkingVisitor::mutator(&mut state)
            .defer_trace_to_mutator_thread_if_concurrent(64, on_mutator, SIZE);
        assert!(!deferred);
    }

    #[test]
    fn test_weak_container_marked_without_strong_trace() {
        let mut objects = Objects::new(1);
        let container = objects.init(0, true);
        let worklists = Arc::new(MarkingWorklists::new());
        let mut state = MarkingState::new(worklists.clone());

        MarkingVisitor::mutator(&mut state).visit_weak_container(
            desc(container),
            None,
            ignore,
            container,
        );

        let header = unsafe { HeapObjectHeader::from_payload(container) };
        assert!(header.is_marked());
        assert!(header.is_weak_container_marked());
        assert!(worklists.marking_is_empty());
        assert_eq!(worklists.weak_container_callbacks.len(), 1);
        assert_eq!(state.marked_bytes(), SIZE);
    }
}
