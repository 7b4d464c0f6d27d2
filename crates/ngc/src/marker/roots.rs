//! Roots - Where marking starts
//!
//! # Root Types
//!
//! 1. **Persistents** - [`Persistent`] handles held outside the heap. Strong
//!    persistents are traced; [`WeakPersistent`]s are cleared after marking
//!    if their target died.
//! 2. **Objects under construction** - Every object between allocation and
//!    `mark_fully_constructed` is in the [`ConstructionRegistry`]. Their
//!    constructors may hold the only references to other objects, so they
//!    are scanned conservatively at the atomic pause.
//! 3. **The native stack** - Scanned conservatively when the collection
//!    says it may contain heap pointers (see `stack`).
//! 4. **Cross-thread persistents** - [`CrossThreadPersistent`] and
//!    [`WeakCrossThreadPersistent`] handles owned by threads other than the
//!    mutator. Only visited in the atomic pause.
//!
//! # Thread Safety
//!
//! Handles may be created, updated and dropped from any thread. Slots are
//! atomics, and the slot table is only write-locked to grow or shrink.
//!
//! Cross-thread handles additionally serialize with the marker through one
//! process-wide lock, held by the atomic pause from visiting strong handles
//! until weak handles are cleared. A weak handle upgraded under that lock
//! either sees its target cleared or keeps it alive.

use crate::marker::visitor::{LivenessBroker, TraceCallback};
use crate::object::member::{trace_callback_of, GarbageCollected};
use crate::util::Address;
use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::marker::PhantomData;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Whether a region keeps its targets alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Strong,
    Weak,
}

impl std::fmt::Display for RootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootKind::Strong => write!(f, "Strong"),
            RootKind::Weak => write!(f, "Weak"),
        }
    }
}

struct PersistentNode {
    value: AtomicUsize,
    trace: Option<TraceCallback>,
    location: Option<&'static Location<'static>>,
}

#[derive(Default)]
struct Slots {
    nodes: Vec<PersistentNode>,
    free: Vec<usize>,
}

/// Slot table backing persistent handles of one kind
pub struct PersistentRegion {
    kind: RootKind,
    slots: RwLock<Slots>,
}

impl PersistentRegion {
    pub fn new(kind: RootKind) -> Self {
        Self {
            kind,
            slots: RwLock::new(Slots::default()),
        }
    }

    pub fn kind(&self) -> RootKind {
        self.kind
    }

    fn allocate_node(
        &self,
        value: Address,
        trace: TraceCallback,
        location: &'static Location<'static>,
    ) -> usize {
        let node = PersistentNode {
            value: AtomicUsize::new(value),
            trace: Some(trace),
            location: Some(location),
        };
        let mut slots = self.slots.write();
        match slots.free.pop() {
            Some(index) => {
                slots.nodes[index] = node;
                index
            }
            None => {
                slots.nodes.push(node);
                slots.nodes.len() - 1
            }
        }
    }

    fn free_node(&self, index: usize) {
        let mut slots = self.slots.write();
        let node = &mut slots.nodes[index];
        node.value.store(0, Ordering::Relaxed);
        node.trace = None;
        node.location = None;
        slots.free.push(index);
    }

    fn load(&self, index: usize) -> Address {
        self.slots.read().nodes[index].value.load(Ordering::Acquire)
    }

    fn store(&self, index: usize, value: Address) {
        self.slots.read().nodes[index]
            .value
            .store(value, Ordering::Release);
    }

    /// Call `f` with every non-empty handle
    pub fn iterate(&self, mut f: impl FnMut(Address, TraceCallback, &'static Location<'static>)) {
        let slots = self.slots.read();
        for node in &slots.nodes {
            let value = node.value.load(Ordering::Acquire);
            if value == 0 {
                continue;
            }
            if let (Some(trace), Some(location)) = (node.trace, node.location) {
                f(value, trace, location);
            }
        }
    }

    /// Clear handles whose target did not survive marking
    pub fn clear_dead(&self, broker: &LivenessBroker) -> usize {
        let slots = self.slots.read();
        let mut cleared = 0;
        for node in &slots.nodes {
            let value = node.value.load(Ordering::Acquire);
            if value != 0 && !broker.is_heap_object_alive(value) {
                node.value.store(0, Ordering::Release);
                cleared += 1;
            }
        }
        cleared
    }

    /// Empty every handle; used at heap teardown
    pub fn clear_all(&self) {
        for node in &self.slots.read().nodes {
            node.value.store(0, Ordering::Release);
        }
    }

    /// Handles currently alive, empty or not
    pub fn handle_count(&self) -> usize {
        let slots = self.slots.read();
        slots.nodes.len() - slots.free.len()
    }
}

impl std::fmt::Debug for PersistentRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRegion")
            .field("kind", &self.kind)
            .field("handles", &self.handle_count())
            .finish()
    }
}

macro_rules! persistent_handle {
    ($name:ident) => {
        impl<T: GarbageCollected> $name<T> {
            #[track_caller]
            pub(crate) fn new_in(region: &Arc<PersistentRegion>, ptr: Option<NonNull<T>>) -> Self {
                let index = region.allocate_node(
                    ptr.map_or(0, |p| p.as_ptr() as Address),
                    trace_callback_of::<T>(),
                    Location::caller(),
                );
                Self {
                    region: Arc::clone(region),
                    index,
                    _marker: PhantomData,
                }
            }

            #[inline]
            pub fn get(&self) -> Option<NonNull<T>> {
                NonNull::new(self.region.load(self.index) as *mut T)
            }

            #[inline]
            pub fn is_null(&self) -> bool {
                self.region.load(self.index) == 0
            }

            pub fn set(&self, ptr: Option<NonNull<T>>) {
                self.region
                    .store(self.index, ptr.map_or(0, |p| p.as_ptr() as Address));
            }

            pub fn clear(&self) {
                self.region.store(self.index, 0);
            }

            /// Borrow the target
            ///
            /// # Safety
            ///
            /// For strong handles the target is alive as long as the handle
            /// holds it. For weak handles the caller must make sure no
            /// collection ran since `get` last returned the target.
            pub unsafe fn as_ref(&self) -> Option<&T> {
                self.get().map(|p| &*p.as_ptr())
            }
        }

        impl<T: GarbageCollected> Clone for $name<T> {
            #[track_caller]
            fn clone(&self) -> Self {
                Self::new_in(&self.region, self.get())
            }
        }

        impl<T> Drop for $name<T> {
            fn drop(&mut self) {
                self.region.free_node(self.index);
            }
        }

        impl<T> std::fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({})"),
                    crate::util::debug::format_address(self.region.load(self.index))
                )
            }
        }
    };
}

/// Strong handle to a heap object, held from outside the heap
pub struct Persistent<T> {
    region: Arc<PersistentRegion>,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

/// Handle that does not keep its target alive
pub struct WeakPersistent<T> {
    region: Arc<PersistentRegion>,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

persistent_handle!(Persistent);
persistent_handle!(WeakPersistent);

/// Process-wide lock guarding cross-thread handles against the marker
static CROSS_THREAD_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Guard returned by [`cross_thread_lock`]
pub type CrossThreadLockGuard = MutexGuard<'static, ()>;

/// Take the process-wide cross-thread handle lock
///
/// Not reentrant: weak callbacks and trace methods must not touch
/// cross-thread handles.
pub fn cross_thread_lock() -> CrossThreadLockGuard {
    CROSS_THREAD_LOCK.lock()
}

/// Strong and weak regions backing cross-thread handles of one heap
#[derive(Debug)]
pub struct CrossThreadRegions {
    strong: PersistentRegion,
    weak: PersistentRegion,
}

impl CrossThreadRegions {
    pub fn new() -> Self {
        Self {
            strong: PersistentRegion::new(RootKind::Strong),
            weak: PersistentRegion::new(RootKind::Weak),
        }
    }

    fn region(&self, kind: RootKind) -> &PersistentRegion {
        match kind {
            RootKind::Strong => &self.strong,
            RootKind::Weak => &self.weak,
        }
    }

    /// Call `f` with every non-empty strong handle
    pub fn iterate_strong(
        &self,
        _lock: &CrossThreadLockGuard,
        f: impl FnMut(Address, TraceCallback, &'static Location<'static>),
    ) {
        self.strong.iterate(f);
    }

    /// Clear weak handles whose target did not survive marking
    pub fn clear_dead_weak(&self, _lock: &CrossThreadLockGuard, broker: &LivenessBroker) -> usize {
        self.weak.clear_dead(broker)
    }

    pub fn clear_all(&self) {
        let _lock = cross_thread_lock();
        self.strong.clear_all();
        self.weak.clear_all();
    }

    pub fn handle_count(&self, kind: RootKind) -> usize {
        self.region(kind).handle_count()
    }
}

impl Default for CrossThreadRegions {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! cross_thread_handle {
    ($name:ident, $kind:expr) => {
        impl<T: GarbageCollected> $name<T> {
            #[track_caller]
            pub(crate) fn new_in(regions: &Arc<CrossThreadRegions>, ptr: Option<NonNull<T>>) -> Self {
                let _lock = cross_thread_lock();
                Self::new_locked(regions, ptr)
            }

            #[track_caller]
            fn new_locked(regions: &Arc<CrossThreadRegions>, ptr: Option<NonNull<T>>) -> Self {
                let index = regions.region($kind).allocate_node(
                    ptr.map_or(0, |p| p.as_ptr() as Address),
                    trace_callback_of::<T>(),
                    Location::caller(),
                );
                Self {
                    regions: Arc::clone(regions),
                    index,
                    _marker: PhantomData,
                }
            }

            fn load_locked(&self) -> Address {
                self.regions.region($kind).load(self.index)
            }

            pub fn get(&self) -> Option<NonNull<T>> {
                let _lock = cross_thread_lock();
                NonNull::new(self.load_locked() as *mut T)
            }

            pub fn is_null(&self) -> bool {
                self.get().is_none()
            }

            pub fn set(&self, ptr: Option<NonNull<T>>) {
                let _lock = cross_thread_lock();
                self.regions
                    .region($kind)
                    .store(self.index, ptr.map_or(0, |p| p.as_ptr() as Address));
            }

            pub fn clear(&self) {
                self.set(None);
            }
        }

        impl<T: GarbageCollected> Clone for $name<T> {
            #[track_caller]
            fn clone(&self) -> Self {
                let _lock = cross_thread_lock();
                Self::new_locked(&self.regions, NonNull::new(self.load_locked() as *mut T))
            }
        }

        impl<T> Drop for $name<T> {
            fn drop(&mut self) {
                let _lock = cross_thread_lock();
                self.regions.region($kind).free_node(self.index);
            }
        }

        impl<T> std::fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let value = {
                    let _lock = cross_thread_lock();
                    self.regions.region($kind).load(self.index)
                };
                write!(
                    f,
                    concat!(stringify!($name), "({})"),
                    crate::util::debug::format_address(value)
                )
            }
        }
    };
}

/// Strong handle that may be owned and used by any thread
pub struct CrossThreadPersistent<T> {
    regions: Arc<CrossThreadRegions>,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

/// Weak handle that may be owned and used by any thread
pub struct WeakCrossThreadPersistent<T> {
    regions: Arc<CrossThreadRegions>,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

cross_thread_handle!(CrossThreadPersistent, RootKind::Strong);
cross_thread_handle!(WeakCrossThreadPersistent, RootKind::Weak);

impl<T: GarbageCollected> WeakCrossThreadPersistent<T> {
    /// Strong handle to the target, empty if the target already died
    #[track_caller]
    pub fn upgrade(&self) -> CrossThreadPersistent<T> {
        let _lock = cross_thread_lock();
        CrossThreadPersistent::new_locked(&self.regions, NonNull::new(self.load_locked() as *mut T))
    }
}

/// Payloads of objects allocated but not yet fully constructed
#[derive(Default)]
pub struct ConstructionRegistry {
    objects: Mutex<IndexSet<Address>>,
}

impl ConstructionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, payload: Address) {
        self.objects.lock().insert(payload);
    }

    pub fn unregister(&self, payload: Address) {
        self.objects.lock().swap_remove(&payload);
    }

    pub fn contains(&self, payload: Address) -> bool {
        self.objects.lock().contains(&payload)
    }

    pub fn snapshot(&self) -> Vec<Address> {
        self.objects.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn clear(&self) {
        self.objects.lock().clear();
    }
}

impl std::fmt::Debug for ConstructionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstructionRegistry")
            .field("objects", &self.len())
            .finish()
    }
}

/// All root sources of one heap
#[derive(Debug)]
pub struct Roots {
    pub strong: Arc<PersistentRegion>,
    pub weak: Arc<PersistentRegion>,
    pub cross_thread: Arc<CrossThreadRegions>,
    pub construction: Arc<ConstructionRegistry>,
}

impl Roots {
    pub fn new() -> Self {
        Self {
            strong: Arc::new(PersistentRegion::new(RootKind::Strong)),
            weak: Arc::new(PersistentRegion::new(RootKind::Weak)),
            cross_thread: Arc::new(CrossThreadRegions::new()),
            construction: Arc::new(ConstructionRegistry::new()),
        }
    }

    /// Drop every root so a final collection reclaims the whole heap
    pub fn clear_all(&self) {
        self.strong.clear_all();
        self.weak.clear_all();
        self.cross_thread.clear_all();
        self.construction.clear();
    }
}

impl Default for Roots {
    fn default() -> Self {
        Self::new()
    }
}
