//! Marker Module - Tracing marking
//!
//! This module finds the objects reachable from the roots.
//!
//! Marking Algorithm:
//! - Tri-color marking with the mark bit in the object header
//! - Incremental steps on the mutator, bounded by a deadline
//! - Optional background markers stealing from the same worklist
//! - Insertion write barrier while marking is active
//!
//! Marking Phases:
//! 1. Start - Visit persistents and register objects under construction
//! 2. Incremental / Concurrent - Drain worklists in steps
//! 3. Atomic pause - Stop background markers, rescan roots (and the stack
//!    if it may hold heap pointers), drain to a fixed point including
//!    ephemerons, then process weakness
//!
//! Root Types:
//! - Strong persistents
//! - Strong cross-thread persistents (atomic pause only, under the
//!   process-wide cross-thread lock)
//! - Objects under construction (scanned conservatively)
//! - The native stack (conservative)

pub mod concurrent;
pub mod marking_state;
pub mod marking_visitor;
pub mod roots;
pub mod stack;
pub mod visitor;
pub mod worklists;

pub use concurrent::ConcurrentMarker;
pub use marking_state::MarkingState;
pub use marking_visitor::{ConservativeMarkingVisitor, MarkingVisitor};
pub use roots::{
    cross_thread_lock, ConstructionRegistry, CrossThreadLockGuard, CrossThreadPersistent, CrossThreadRegions,
    Persistent, PersistentRegion, RootKind, Roots, WeakCrossThreadPersistent, WeakPersistent,
};
pub use stack::{NativeStackScanner, StackScanner};
pub use visitor::{LivenessBroker, TraceCallback, TraceDescriptor, Visitor, WeakCallback};
pub use worklists::MarkingWorklists;

use crate::config::{MarkingType, StackState};
use crate::heap::RawHeap;
use crate::object::gc_info::GcInfoTable;
use crate::object::header::HeapObjectHeader;
use crate::platform::Platform;
use crate::stats::timer::Deadline;
use std::sync::Arc;
use std::time::Duration;

/// Worklist items processed between deadline checks
const DEADLINE_CHECK_INTERVAL: usize = 150;

/// Marking phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingPhase {
    NotMarking,
    Incremental,
    AtomicPause,
    Done,
}

/// Everything marking reads from the heap
pub struct MarkingContext<'a> {
    pub raw_heap: &'a RawHeap,
    pub gc_info: &'a GcInfoTable,
    pub roots: &'a Roots,
    pub stack: Option<&'a dyn StackScanner>,
    pub platform: &'a dyn Platform,
}

/// Outcome of a finished marking cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkingResult {
    pub marked_bytes: usize,
    pub marked_objects: usize,
    pub weak_persistents_cleared: usize,
    pub movable_references: usize,
}

/// Marker - one marking cycle
///
/// Created when a collection starts and dropped once sweeping begins.
pub struct Marker {
    marking_type: MarkingType,
    phase: MarkingPhase,
    worklists: Arc<MarkingWorklists>,
    mutator_state: MarkingState,
    concurrent: Option<ConcurrentMarker>,
    concurrent_threads: usize,
    concurrent_marked_bytes: usize,
}

impl Marker {
    pub fn new(marking_type: MarkingType, concurrent_threads: usize) -> Self {
        let worklists = Arc::new(MarkingWorklists::new());
        Self {
            marking_type,
            phase: MarkingPhase::NotMarking,
            mutator_state: MarkingState::new(Arc::clone(&worklists)),
            worklists,
            concurrent: None,
            concurrent_threads,
            concurrent_marked_bytes: 0,
        }
    }

    pub fn marking_type(&self) -> MarkingType {
        self.marking_type
    }

    pub fn phase(&self) -> MarkingPhase {
        self.phase
    }

    /// Shared worklists, used by the write barrier
    pub fn worklists(&self) -> &Arc<MarkingWorklists> {
        &self.worklists
    }

    pub fn is_concurrent_marking_running(&self) -> bool {
        self.concurrent.as_ref().is_some_and(|c| c.is_running())
    }

    /// Begin marking
    ///
    /// Atomic marking does all its work in [`finish_marking`](Self::finish_marking).
    pub fn start_marking(&mut self, cx: &MarkingContext<'_>) {
        debug_assert_eq!(self.phase, MarkingPhase::NotMarking);
        if self.marking_type == MarkingType::Atomic {
            self.phase = MarkingPhase::AtomicPause;
            return;
        }
        self.phase = MarkingPhase::Incremental;
        self.visit_persistents(cx);
        for payload in cx.roots.construction.snapshot() {
            // SAFETY: the registry only holds payloads of live allocations.
            let header = unsafe { HeapObjectHeader::from_payload(payload) };
            self.worklists.push_not_fully_constructed(header.address());
        }
        if self.marking_type == MarkingType::IncrementalAndConcurrent {
            self.concurrent = Some(ConcurrentMarker::start(
                cx.platform,
                Arc::clone(&self.worklists),
                self.concurrent_threads,
            ));
        }
        log::debug!(
            "Marking started ({:?}, {} construction roots)",
            self.marking_type,
            cx.roots.construction.len()
        );
    }

    /// Run one incremental step
    ///
    /// Returns true if the mutator drained every worklist and no background
    /// marker has work in flight, i.e. the atomic pause would be short.
    pub fn advance_marking_with_deadline(&mut self, cx: &MarkingContext<'_>, budget: Duration) -> bool {
        if self.phase != MarkingPhase::Incremental {
            return false;
        }
        let deadline = Deadline::after(budget);
        self.process_not_fully_constructed_incrementally(cx);
        let drained = self.process_worklists(cx, &deadline);
        drained
            && self
                .concurrent
                .as_ref()
                .map_or(true, |concurrent| concurrent.is_idle())
    }

    /// The atomic pause: mark to completion and process weakness
    pub fn finish_marking(&mut self, cx: &MarkingContext<'_>, stack_state: StackState) -> MarkingResult {
        // Held until cross-thread weak handles are cleared
        let cross_thread = cross_thread_lock();
        self.enter_atomic_pause(cx, stack_state, &cross_thread);
        self.process_worklists_to_fixed_point(cx);
        let weak_persistents_cleared = self.process_weakness(cx, &cross_thread);
        drop(cross_thread);
        self.phase = MarkingPhase::Done;

        let result = MarkingResult {
            marked_bytes: self.marked_bytes(),
            marked_objects: self.mutator_state.marked_objects(),
            weak_persistents_cleared,
            movable_references: self.mutator_state.movable_references(),
        };
        log::debug!(
            "Marking finished: {} bytes live, {} weak persistents cleared",
            result.marked_bytes,
            result.weak_persistents_cleared
        );
        result
    }

    /// Bytes marked by the mutator and by finished background markers
    pub fn marked_bytes(&self) -> usize {
        self.mutator_state.marked_bytes() + self.concurrent_marked_bytes
    }

    /// Abandon marking, e.g. at heap teardown
    pub fn cancel(&mut self) {
        if let Some(mut concurrent) = self.concurrent.take() {
            concurrent.cancel_and_join();
        }
        self.worklists.clear();
        self.phase = MarkingPhase::NotMarking;
    }

    fn enter_atomic_pause(
        &mut self,
        cx: &MarkingContext<'_>,
        stack_state: StackState,
        cross_thread: &CrossThreadLockGuard,
    ) {
        if let Some(mut concurrent) = self.concurrent.take() {
            concurrent.cancel_and_join();
            self.concurrent_marked_bytes += concurrent.marked_bytes();
        }
        self.phase = MarkingPhase::AtomicPause;

        self.visit_persistents(cx);
        let state = &mut self.mutator_state;
        cx.roots
            .cross_thread
            .iterate_strong(cross_thread, |payload, trace, _| {
                state.mark_and_push(TraceDescriptor {
                    base_object_payload: payload,
                    callback: trace,
                });
            });

        let mut visitor =
            ConservativeMarkingVisitor::new(&mut self.mutator_state, cx.raw_heap, cx.gc_info);
        for payload in cx.roots.construction.snapshot() {
            // SAFETY: the registry only holds payloads of live allocations.
            let header = unsafe { HeapObjectHeader::from_payload(payload) };
            visitor.trace_header_conservatively(header);
        }

        if stack_state == StackState::MayContainHeapPointers {
            match cx.stack {
                Some(stack) => {
                    stack.iterate_pointers(&mut |word| visitor.trace_conservatively_if_needed(word))
                }
                None => log::trace!("No stack scanner registered, skipping stack"),
            }
        }
    }

    fn visit_persistents(&mut self, cx: &MarkingContext<'_>) {
        let state = &mut self.mutator_state;
        cx.roots.strong.iterate(|payload, trace, location| {
            log::trace!(
                "Root {} from {}:{}",
                crate::util::debug::format_address(payload),
                location.file(),
                location.line()
            );
            state.mark_and_push(TraceDescriptor {
                base_object_payload: payload,
                callback: trace,
            });
        });
    }

    fn process_not_fully_constructed_incrementally(&mut self, cx: &MarkingContext<'_>) {
        let pending = self.worklists.take_not_fully_constructed();
        for address in pending {
            // SAFETY: entries are headers of live allocations.
            let header = unsafe { HeapObjectHeader::at(address) };
            if header.is_in_construction() {
                self.worklists.push_not_fully_constructed(address);
                continue;
            }
            let info = cx.gc_info.get(header.gc_info_index());
            self.mutator_state.mark_and_push(TraceDescriptor {
                base_object_payload: header.payload(),
                callback: info.trace,
            });
        }
    }

    fn process_not_fully_constructed_atomically(&mut self, cx: &MarkingContext<'_>) {
        let pending = self.worklists.take_not_fully_constructed();
        if pending.is_empty() {
            return;
        }
        let mut visitor =
            ConservativeMarkingVisitor::new(&mut self.mutator_state, cx.raw_heap, cx.gc_info);
        for address in pending {
            // SAFETY: entries are headers of live allocations.
            let header = unsafe { HeapObjectHeader::at(address) };
            visitor.trace_header_conservatively(header);
        }
    }

    /// Drain the mutator worklists; false if the deadline hit first
    fn process_worklists(&mut self, cx: &MarkingContext<'_>, deadline: &Deadline) -> bool {
        let worklists = Arc::clone(&self.worklists);
        let mut visitor = MarkingVisitor::mutator(&mut self.mutator_state);
        let mut processed = 0usize;
        let mut out_of_time = || {
            processed += 1;
            processed % DEADLINE_CHECK_INTERVAL == 0 && deadline.is_reached()
        };

        loop {
            while let Some(item) = worklists.concurrent_marking_bailout.pop() {
                visitor.state().account_marked_bytes(item.bailedout_size);
                (item.callback)(&mut visitor, item.parameter);
                if out_of_time() {
                    return false;
                }
            }

            // Already accounted when first traced
            while let Some(address) = worklists.retrace_marked_objects.pop() {
                // SAFETY: retraced headers belong to marked, live objects.
                let header = unsafe { HeapObjectHeader::at(address) };
                let info = cx.gc_info.get(header.gc_info_index());
                (info.trace)(&mut visitor, header.payload());
                if out_of_time() {
                    return false;
                }
            }

            while let Some(address) = worklists.write_barrier.pop() {
                // SAFETY: the write barrier only records live headers.
                let header = unsafe { HeapObjectHeader::at(address) };
                visitor.state().account_marked_bytes(header.allocated_size());
                let info = cx.gc_info.get(header.gc_info_index());
                (info.trace)(&mut visitor, header.payload());
                if out_of_time() {
                    return false;
                }
            }

            while let Some(item) = worklists.pop_marking() {
                let payload = item.desc.base_object_payload;
                // SAFETY: marking items always describe heap objects.
                let header = unsafe { HeapObjectHeader::from_payload(payload) };
                visitor.state().account_marked_bytes(header.allocated_size());
                (item.desc.callback)(&mut visitor, payload);
                if out_of_time() {
                    return false;
                }
            }

            if !worklists.has_mutator_work() {
                return true;
            }
        }
    }

    fn process_worklists_to_fixed_point(&mut self, cx: &MarkingContext<'_>) {
        let never = Deadline::never();
        let mut rounds = 0;
        loop {
            rounds += 1;
            self.process_worklists(cx, &never);
            self.process_not_fully_constructed_atomically(cx);
            if !self.worklists.is_empty() {
                continue;
            }

            let mut pairs = Vec::new();
            while let Some(pair) = self.worklists.discovered_ephemeron_pairs.pop() {
                pairs.push(pair);
            }
            if pairs.is_empty() {
                break;
            }
            let marked_before = self.mutator_state.marked_objects();
            for pair in pairs {
                self.mutator_state.process_ephemeron(pair.key, pair.value_desc);
            }
            if self.mutator_state.marked_objects() == marked_before && self.worklists.is_empty() {
                // Every remaining pair has a dead key
                break;
            }
        }
        log::trace!("Marking reached a fixed point after {} rounds", rounds);
    }

    fn process_weakness(&mut self, cx: &MarkingContext<'_>, cross_thread: &CrossThreadLockGuard) -> usize {
        let broker = LivenessBroker::new();
        while let Some(item) = self.worklists.weak_container_callbacks.pop() {
            (item.callback)(&broker, item.parameter);
        }
        while let Some(item) = self.worklists.weak_callbacks.pop() {
            (item.callback)(&broker, item.parameter);
        }
        let cleared = cx.roots.weak.clear_dead(&broker)
            + cx.roots.cross_thread.clear_dead_weak(cross_thread, &broker);
        self.worklists.clear_weak_work();

        if !self.worklists.is_empty() {
            crate::fatal!("Marking worklists not empty after the atomic pause: {:?}", self.worklists);
        }
        cleared
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        if let Some(mut concurrent) = self.concurrent.take() {
            concurrent.cancel_and_join();
        }
    }
}

impl std::fmt::Debug for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marker")
            .field("marking_type", &self.marking_type)
            .field("phase", &self.phase)
            .field("marked_bytes", &self.marked_bytes())
            .finish()
    }
}
