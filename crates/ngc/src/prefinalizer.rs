//! Pre-finalizers - Callbacks that run before sweeping
//!
//! A pre-finalizer is registered for one object and runs once, on the
//! mutator thread, after the marking cycle that found the object dead and
//! before any sweeping starts. At that point every object, dead or alive,
//! is still intact, so a pre-finalizer may read other heap objects. That is
//! what sets it apart from the type's `Drop`, which runs during sweeping in
//! no particular order.
//!
//! Allocation is forbidden while pre-finalizers run. Objects that survive
//! keep their registration for the next cycle.

use crate::marker::visitor::LivenessBroker;
use crate::util::Address;
use parking_lot::Mutex;

struct PreFinalizerEntry {
    payload: Address,
    callback: Box<dyn FnOnce(Address) + Send>,
}

/// Registered pre-finalizers of one heap
#[derive(Default)]
pub struct PreFinalizerRegistry {
    entries: Mutex<Vec<PreFinalizerEntry>>,
}

impl PreFinalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, payload: Address, callback: F)
    where
        F: FnOnce(Address) + Send + 'static,
    {
        self.entries.lock().push(PreFinalizerEntry {
            payload,
            callback: Box::new(callback),
        });
    }

    /// Run the pre-finalizers of every object the broker reports dead
    ///
    /// Must be called after marking and before sweeping. Returns how many
    /// ran.
    pub fn invoke_for_dead(&self, broker: &LivenessBroker) -> usize {
        let dead: Vec<PreFinalizerEntry> = {
            let mut entries = self.entries.lock();
            let (dead, alive) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|entry| !broker.is_heap_object_alive(entry.payload));
            *entries = alive;
            dead
        };
        // Callbacks may register for other objects, so the lock is released
        let count = dead.len();
        for entry in dead {
            (entry.callback)(entry.payload);
        }
        if count > 0 {
            log::debug!("Invoked {} pre-finalizers", count);
        }
        count
    }

    /// Remove the registrations of `payload` and hand back their callbacks
    pub fn take_for(&self, payload: Address) -> Vec<Box<dyn FnOnce(Address) + Send>> {
        let mut entries = self.entries.lock();
        let mut taken = Vec::new();
        let mut index = 0;
        while index < entries.len() {
            if entries[index].payload == payload {
                taken.push(entries.swap_remove(index).callback);
            } else {
                index += 1;
            }
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for PreFinalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreFinalizerRegistry")
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::HeapObjectHeader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[repr(align(16))]
    struct Arena([u8; 256]);

    #[test]
    fn test_only_dead_objects_are_invoked() {
        let mut memory = Box::new(Arena([0; 256]));
        let base = memory.0.as_mut_ptr() as Address;
        // SAFETY: the arena is zeroed, aligned and large enough for two headers.
        let (live, dead) = unsafe {
            let live = HeapObjectHeader::initialize(base, 64, 1);
            let dead = HeapObjectHeader::initialize(base + 64, 64, 1);
            live.try_mark_atomic();
            (live.payload(), dead.payload())
        };
        let registry = PreFinalizerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for payload in [live, dead] {
            let calls = Arc::clone(&calls);
            registry.register(payload, move |address| {
                assert_eq!(address, payload);
                calls.fetch_add(1, Ordering::Relaxed);
            });
        }

        let invoked = registry.invoke_for_dead(&LivenessBroker::new());

        assert_eq!(invoked, 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1, "survivor keeps its registration");
        assert_eq!(registry.take_for(live).len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_take_for_removes_every_registration() {
        let registry = PreFinalizerRegistry::new();
        registry.register(0x100, |_| {});
        registry.register(0x200, |_| {});
        registry.register(0x100, |_| {});

        assert_eq!(registry.take_for(0x100).len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.take_for(0x300).is_empty());
    }
}
