//! Visitor - the interface objects trace themselves through
//!
//! [`GarbageCollected::trace`] receives a `&mut dyn Visitor`. The untyped
//! methods on the trait are what marking implementations override; the typed
//! helpers on `dyn Visitor` turn members into [`TraceDescriptor`]s.

use crate::object::header::HeapObjectHeader;
use crate::object::member::{trace_trampoline, EphemeronPair, GarbageCollected, Member, WeakMember};
use crate::util::Address;
use std::ptr::NonNull;

/// Traces the object whose payload is passed
pub type TraceCallback = fn(&mut dyn Visitor, Address);

/// Runs after marking with liveness information
pub type WeakCallback = fn(&LivenessBroker, Address);

/// Object start plus the callback that traces it
#[derive(Clone, Copy)]
pub struct TraceDescriptor {
    pub base_object_payload: Address,
    pub callback: TraceCallback,
}

impl TraceDescriptor {
    #[inline]
    pub fn of<T: GarbageCollected>(payload: Address) -> Self {
        Self {
            base_object_payload: payload,
            callback: trace_trampoline::<T>,
        }
    }
}

impl std::fmt::Debug for TraceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceDescriptor")
            .field(
                "base_object_payload",
                &crate::util::debug::format_address(self.base_object_payload),
            )
            .finish()
    }
}

/// Receives the references of a traced object
pub trait Visitor {
    /// Strong reference to the object described by `desc`
    fn visit(&mut self, desc: TraceDescriptor);

    /// Weak reference; `callback(parameter)` runs after marking unless the
    /// target is already known to be live
    fn visit_weak(&mut self, desc: TraceDescriptor, callback: WeakCallback, parameter: Address);

    /// Ephemeron: trace `value_desc` only once `key` is live
    fn visit_ephemeron(&mut self, key: Address, value_desc: TraceDescriptor);

    /// Container holding weak entries
    ///
    /// The container is marked without tracing its entries strongly.
    /// `weak_desc`, if any, traces the parts that must still be visited.
    /// `strong_desc` is used when the container is found conservatively and
    /// must be kept fully alive.
    fn visit_weak_container(
        &mut self,
        strong_desc: TraceDescriptor,
        weak_desc: Option<TraceDescriptor>,
        callback: WeakCallback,
        parameter: Address,
    );

    /// Run `callback(parameter)` after marking
    fn register_weak_callback(&mut self, callback: WeakCallback, parameter: Address);

    /// Slot that a compacting collector would update
    fn register_movable_reference(&mut self, _slot: Address) {}

    /// Hand tracing of the object back to the mutator thread
    ///
    /// Returns true if the visitor runs on a background thread and took the
    /// object; `callback(parameter)` is then invoked later on the mutator.
    fn defer_trace_to_mutator_thread_if_concurrent(
        &mut self,
        _parameter: Address,
        _callback: TraceCallback,
        _deferred_size: usize,
    ) -> bool {
        false
    }
}

impl<'v> dyn Visitor + 'v {
    /// Trace a strong member
    #[inline]
    pub fn trace<T: GarbageCollected>(&mut self, member: &Member<T>) {
        let payload = member.raw();
        if payload != 0 {
            self.visit(TraceDescriptor::of::<T>(payload));
        }
    }

    /// Trace a weak member, clearing it after marking if the target died
    #[inline]
    pub fn trace_weak<T: GarbageCollected>(&mut self, member: &WeakMember<T>) {
        let payload = member.raw();
        if payload != 0 {
            self.visit_weak(
                TraceDescriptor::of::<T>(payload),
                clear_weak_member_if_dead::<T>,
                member as *const WeakMember<T> as Address,
            );
        }
    }

    /// Trace an ephemeron pair
    ///
    /// A pair with an empty key keeps nothing alive.
    pub fn trace_ephemeron<K: GarbageCollected, V: GarbageCollected>(
        &mut self,
        pair: &EphemeronPair<K, V>,
    ) {
        let key = pair.key.raw();
        if key == 0 {
            return;
        }
        self.register_weak_callback(
            clear_ephemeron_if_dead::<K, V>,
            pair as *const EphemeronPair<K, V> as Address,
        );
        let value = pair.value.raw();
        if value != 0 {
            self.visit_ephemeron(key, TraceDescriptor::of::<V>(value));
        }
    }

    /// Trace a member pointing at a weak container
    pub fn trace_weak_container<T: GarbageCollected>(
        &mut self,
        container: &Member<T>,
        weak_trace: Option<TraceCallback>,
        callback: WeakCallback,
    ) {
        let payload = container.raw();
        if payload == 0 {
            return;
        }
        let weak_desc = weak_trace.map(|callback| TraceDescriptor {
            base_object_payload: payload,
            callback,
        });
        self.visit_weak_container(TraceDescriptor::of::<T>(payload), weak_desc, callback, payload);
    }
}

fn clear_weak_member_if_dead<T: GarbageCollected>(broker: &LivenessBroker, slot: Address) {
    // SAFETY: the slot sits inside an object that was traced, so it is live.
    let member = unsafe { &*(slot as *const WeakMember<T>) };
    if !broker.is_heap_object_alive(member.raw()) {
        member.clear();
    }
}

fn clear_ephemeron_if_dead<K: GarbageCollected, V: GarbageCollected>(
    broker: &LivenessBroker,
    slot: Address,
) {
    // SAFETY: as above, the pair is embedded in a traced object.
    let pair = unsafe { &*(slot as *const EphemeronPair<K, V>) };
    if !broker.is_heap_object_alive(pair.key.raw()) {
        pair.clear();
    }
}

/// Answers liveness queries during weak processing
///
/// Only valid after marking finished and before sweeping starts.
pub struct LivenessBroker {
    _private: (),
}

impl LivenessBroker {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }

    /// Null counts as alive, so callers never clear empty slots
    pub fn is_heap_object_alive(&self, payload: Address) -> bool {
        if payload == 0 {
            return true;
        }
        // SAFETY: weak slots only hold payloads of heap objects, and the
        // pages stay mapped until sweeping.
        unsafe { HeapObjectHeader::from_payload(payload) }.is_marked()
    }

    pub fn is_alive<T>(&self, object: NonNull<T>) -> bool {
        self.is_heap_object_alive(object.as_ptr() as Address)
    }
}
