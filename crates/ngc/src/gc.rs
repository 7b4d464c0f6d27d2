//! GC Core Module - Collection cycle management
//!
//! [`Heap`] ties the components of one managed heap together and drives
//! collection cycles:
//!
//! ```text
//! Idle ──► Marking (atomic, or incremental steps) ──► AtomicPause ──► Sweeping ──► Idle
//! ```
//!
//! Collections are requested through the [`GarbageCollector`] interface.
//! Allocation reaches it through [`HeapGrowing`] and the [`GcInvoker`], which
//! defers conservative requests the platform cannot serve synchronously.
//!
//! While finalizers run, while the atomic pause runs, and inside a
//! [`NoGarbageCollectionScope`], collection requests are ignored.

use crate::allocator::{ObjectAllocator, UnconstructedObject};
use crate::config::{CollectionType, GcConfig, HeapConfig, MarkingType, StackState, SweepingType, MB};
use crate::error::{NgcError, Result};
use crate::explicit::ExplicitManagement;
use crate::heap::RawHeap;
use crate::heap_growing::HeapGrowing;
use crate::invoker::GcInvoker;
use crate::logging::{GcEvent, GcLogger, GcLoggerConfig, LogLevel};
use crate::marker::{
    CrossThreadPersistent, LivenessBroker, Marker, MarkingContext, MarkingWorklists, Persistent, Roots,
    StackScanner, WeakCrossThreadPersistent, WeakPersistent,
};
use crate::object::gc_info::{GcInfoIndex, GcInfoTable};
use crate::object::header::HeapObjectHeader;
use crate::object::member::{GarbageCollected, Member, WeakMember};
use crate::platform::{Platform, TaskHandle};
use crate::prefinalizer::PreFinalizerRegistry;
use crate::stats::{
    collect_page_statistics, AllocationObserver, GcTimer, HeapStatistics, PageStatistics, StatsCollector,
    SweepStats,
};
use crate::sweeper::{Sweeper, SweeperConfig, SweepingObserver};
use crate::util::Address;
use parking_lot::{Mutex, RwLock};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Allocation volume between allocation-driven marking steps
const ALLOCATED_BYTES_PER_MARKING_STEP: usize = MB;

/// Interface of something that can run collections
///
/// Implemented by [`Heap`] and by the [`GcInvoker`] wrapping it.
pub trait GarbageCollector: Send + Sync {
    /// Run a full collection with atomic marking
    fn collect_garbage(&self, config: GcConfig);

    /// Start incremental marking; finalized later
    fn start_incremental_garbage_collection(&self, config: GcConfig);

    /// Number of completed collections
    fn epoch(&self) -> usize;

    fn override_stack_state(&self) -> Option<StackState>;

    /// Force the stack state of collections until cleared
    fn set_override_stack_state(&self, state: StackState);

    fn clear_overridden_stack_state(&self);
}

/// Collection phase of a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Marking,
    AtomicPause,
    Sweeping,
}

/// Phase flags shared by the heap components
#[derive(Debug, Default)]
pub struct HeapFlags {
    marking: AtomicBool,
    atomic_pause: AtomicBool,
    no_gc: AtomicUsize,
    no_allocation: AtomicUsize,
}

impl HeapFlags {
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    #[inline]
    pub fn in_atomic_pause(&self) -> bool {
        self.atomic_pause.load(Ordering::Acquire)
    }

    /// Whether collection requests must be ignored right now
    #[inline]
    pub fn is_gc_forbidden(&self) -> bool {
        self.in_atomic_pause()
            || self.no_gc.load(Ordering::Acquire) > 0
            || self.no_allocation.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn is_allocation_allowed(&self) -> bool {
        self.no_allocation.load(Ordering::Acquire) == 0
    }

    pub(crate) fn set_marking(&self, marking: bool) {
        self.marking.store(marking, Ordering::Release);
    }

    pub fn no_gc_scope(&self) -> NoGarbageCollectionScope<'_> {
        self.no_gc.fetch_add(1, Ordering::AcqRel);
        NoGarbageCollectionScope { flags: self }
    }

    /// Scope in which allocation fails and collections are ignored
    ///
    /// Finalizers run inside one.
    pub fn no_allocation_scope(&self) -> NoAllocationScope<'_> {
        self.no_allocation.fetch_add(1, Ordering::AcqRel);
        NoAllocationScope { flags: self }
    }

    pub(crate) fn atomic_pause_scope(&self) -> AtomicPauseScope<'_> {
        let was_in_pause = self.atomic_pause.swap(true, Ordering::AcqRel);
        debug_assert!(!was_in_pause, "nested atomic pause");
        AtomicPauseScope { flags: self }
    }
}

/// Collections are ignored while this guard lives
#[must_use]
pub struct NoGarbageCollectionScope<'a> {
    flags: &'a HeapFlags,
}

impl Drop for NoGarbageCollectionScope<'_> {
    fn drop(&mut self) {
        self.flags.no_gc.fetch_sub(1, Ordering::AcqRel);
    }
}

#[must_use]
pub struct NoAllocationScope<'a> {
    flags: &'a HeapFlags,
}

impl Drop for NoAllocationScope<'_> {
    fn drop(&mut self) {
        self.flags.no_allocation.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct AtomicPauseScope<'a> {
    flags: &'a HeapFlags,
}

impl Drop for AtomicPauseScope<'_> {
    fn drop(&mut self) {
        self.flags.atomic_pause.store(false, Ordering::Release);
    }
}

/// Marking cycle in progress
struct MarkingCycle {
    marker: Marker,
    timer: GcTimer,
    cycle: u64,
}

/// Runs a marking step every [`ALLOCATED_BYTES_PER_MARKING_STEP`] bytes
struct MarkingStepObserver {
    heap: Weak<Heap>,
    allocated: AtomicUsize,
}

impl AllocationObserver for MarkingStepObserver {
    fn allocated_object_size_increased(&self, bytes: usize) {
        let total = self.allocated.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if total < ALLOCATED_BYTES_PER_MARKING_STEP {
            return;
        }
        self.allocated.store(0, Ordering::Relaxed);
        if let Some(heap) = self.heap.upgrade() {
            heap.allocation_driven_marking_step();
        }
    }
}

struct SweepCompletionLogger {
    logger: Arc<GcLogger>,
}

impl SweepingObserver for SweepCompletionLogger {
    fn sweeping_completed(&self, stats: &SweepStats) {
        self.logger.log(GcEvent::SweepCompleted {
            pages_swept: stats.pages_swept,
            pages_released: stats.pages_pooled + stats.pages_destroyed,
            objects_finalized: stats.objects_finalized,
            bytes_reclaimed: stats.bytes_reclaimed,
        });
    }
}

/// One managed heap
///
/// # Examples
///
/// ```rust
/// use ngc::{DefaultPlatform, GarbageCollected, GcConfig, Heap, HeapConfig, Member, Visitor};
/// use std::sync::Arc;
///
/// struct Node {
///     next: Member<Node>,
/// }
///
/// impl GarbageCollected for Node {
///     fn trace(&self, visitor: &mut dyn Visitor) {
///         visitor.trace(&self.next);
///     }
/// }
///
/// let heap = Heap::new(HeapConfig::default(), Arc::new(DefaultPlatform::new())).unwrap();
/// let node = heap.make_garbage_collected(Node { next: Member::null() }).unwrap();
/// let root = heap.persistent(Some(node));
///
/// heap.collect_garbage(GcConfig::precise_atomic());
/// assert!(root.get().is_some());
/// ```
pub struct Heap {
    config: HeapConfig,
    platform: Arc<dyn Platform>,
    raw_heap: Arc<RawHeap>,
    gc_info: Arc<GcInfoTable>,
    stats: Arc<StatsCollector>,
    flags: Arc<HeapFlags>,
    logger: Arc<GcLogger>,
    roots: Roots,
    prefinalizers: Arc<PreFinalizerRegistry>,
    sweeper: Arc<Sweeper>,
    allocator: ObjectAllocator,
    explicit: ExplicitManagement,
    invoker: Arc<GcInvoker>,
    growing: Arc<HeapGrowing>,
    marking: Mutex<Option<MarkingCycle>>,
    barrier_worklists: RwLock<Option<Arc<MarkingWorklists>>>,
    stack_scanner: RwLock<Option<Arc<dyn StackScanner>>>,
    override_stack_state: Mutex<Option<StackState>>,
    epoch: AtomicUsize,
    in_collection: AtomicBool,
    incremental_task: Mutex<Option<TaskHandle>>,
    self_ref: Weak<Heap>,
}

impl Heap {
    /// Create a heap
    ///
    /// # Errors
    ///
    /// Returns [`NgcError::Configuration`](crate::NgcError::Configuration)
    /// if `config` fails validation.
    pub fn new(config: HeapConfig, platform: Arc<dyn Platform>) -> Result<Arc<Self>> {
        config.validate()?;

        let heap = Arc::new_cyclic(|self_ref: &Weak<Heap>| {
            let raw_heap = Arc::new(RawHeap::new(&config.custom_spaces, config.page_pool_limit));
            let gc_info = Arc::new(GcInfoTable::new());
            let stats = Arc::new(StatsCollector::new());
            let flags = Arc::new(HeapFlags::default());
            let logger = Arc::new(GcLogger::new(GcLoggerConfig {
                level: if config.verbose { LogLevel::Trace } else { LogLevel::Debug },
                console: config.verbose,
                json: config.log_json,
                ..GcLoggerConfig::default()
            }));
            let roots = Roots::new();
            let prefinalizers = Arc::new(PreFinalizerRegistry::new());

            let sweeper = Sweeper::new(
                Arc::clone(&raw_heap),
                Arc::clone(&gc_info),
                Arc::clone(&stats),
                Arc::clone(&platform),
                Arc::clone(&flags),
                SweeperConfig {
                    sweeping_threads: config.concurrent_sweeping_threads,
                    incremental_step: config.incremental_sweeping_step,
                },
            );
            sweeper.register_observer(Arc::new(SweepCompletionLogger {
                logger: Arc::clone(&logger),
            }));

            let allocator = ObjectAllocator::new(
                Arc::clone(&raw_heap),
                Arc::clone(&stats),
                Arc::clone(&sweeper),
                Arc::clone(&roots.construction),
                Arc::clone(&flags),
                config.sweep_for_allocation_budget,
            );
            let explicit = ExplicitManagement::new(
                Arc::clone(&raw_heap),
                Arc::clone(&gc_info),
                Arc::clone(&stats),
                Arc::clone(&sweeper),
                Arc::clone(&prefinalizers),
                Arc::clone(&flags),
                Arc::clone(&logger),
            );

            let collector: Weak<dyn GarbageCollector> = self_ref.clone();
            let invoker = Arc::new(GcInvoker::new(collector, Arc::clone(&platform)));
            let invoker_weak: Weak<dyn GarbageCollector> =
                Arc::downgrade(&invoker) as Weak<dyn GarbageCollector>;
            let growing = Arc::new(HeapGrowing::new(invoker_weak, Arc::clone(&stats), &config));
            stats.register_observer(Arc::clone(&growing) as Arc<dyn AllocationObserver>);
            stats.register_observer(Arc::new(MarkingStepObserver {
                heap: self_ref.clone(),
                allocated: AtomicUsize::new(0),
            }));

            Heap {
                config,
                platform,
                raw_heap,
                gc_info,
                stats,
                flags,
                logger,
                roots,
                prefinalizers,
                sweeper,
                allocator,
                explicit,
                invoker,
                growing,
                marking: Mutex::new(None),
                barrier_worklists: RwLock::new(None),
                stack_scanner: RwLock::new(None),
                override_stack_state: Mutex::new(None),
                epoch: AtomicUsize::new(0),
                in_collection: AtomicBool::new(false),
                incremental_task: Mutex::new(None),
                self_ref: self_ref.clone(),
            }
        });
        log::debug!(
            "Heap created (marking {:?}, sweeping {:?}, {} custom spaces)",
            heap.config.marking_support,
            heap.config.sweeping_support,
            heap.config.custom_spaces.len()
        );
        Ok(heap)
    }

    // === Allocation ===

    /// Register `T` and return its GC info index
    pub fn register_type<T: GarbageCollected>(&self) -> Result<GcInfoIndex> {
        self.gc_info.index_for::<T>()
    }

    /// Allocate raw object memory
    ///
    /// The object stays in construction until the returned handle is
    /// consumed. `custom_space` is an index among the configured custom
    /// spaces.
    pub fn allocate_object(
        &self,
        size: usize,
        alignment: usize,
        custom_space: Option<usize>,
        gc_info: GcInfoIndex,
    ) -> Result<UnconstructedObject> {
        self.allocator.allocate(size, alignment, custom_space, gc_info)
    }

    /// Move `value` onto the heap
    pub fn make_garbage_collected<T: GarbageCollected>(&self, value: T) -> Result<NonNull<T>> {
        let gc_info = self.gc_info.index_for::<T>()?;
        let object = self.allocator.allocate(
            std::mem::size_of::<T>(),
            std::mem::align_of::<T>(),
            T::CUSTOM_SPACE,
            gc_info,
        )?;
        // SAFETY: the payload is zeroed, suitably aligned and big enough.
        unsafe { std::ptr::write(object.payload().as_ptr() as *mut T, value) };
        Ok(object.mark_fully_constructed().cast())
    }

    // === Explicit management ===

    /// Finalize and free an object nothing references any more
    pub fn free_unreferenced_object<T>(&self, object: NonNull<T>) {
        self.explicit
            .free_unreferenced_object(object.as_ptr() as Address);
    }

    /// Resize the object at `payload` in place
    pub fn resize_object(&self, payload: NonNull<u8>, new_size: usize) -> bool {
        self.explicit
            .resize_object(payload.as_ptr() as Address, new_size)
    }

    /// Run `callback` once the object is found dead, before anything is swept
    ///
    /// Pre-finalizers may read other heap objects, dead or alive, but must
    /// not allocate. An explicit free runs them right before the finalizer.
    ///
    /// # Errors
    ///
    /// Returns [`NgcError::InvalidArgument`] if `object` is not the start of
    /// an object on this heap.
    pub fn register_prefinalizer<T, F>(&self, object: NonNull<T>, callback: F) -> Result<()>
    where
        T: GarbageCollected,
        F: FnOnce(&T) + Send + 'static,
    {
        let payload = object.as_ptr() as Address;
        let is_object_start = self
            .raw_heap
            .lookup_page(payload)
            .and_then(|page| page.find_object_header(payload).map(|header| header.payload() == payload))
            .unwrap_or(false);
        if !is_object_start {
            crate::bail!(NgcError::InvalidArgument(format!(
                "{} is not an object of this heap",
                crate::util::debug::format_address(payload)
            )));
        }
        self.prefinalizers.register(payload, move |payload| {
            // SAFETY: pre-finalizers run before the object is swept.
            callback(unsafe { &*(payload as *const T) })
        });
        Ok(())
    }

    // === References ===

    /// Store `value` into `slot`, running the write barrier
    pub fn assign<T: GarbageCollected>(&self, slot: &Member<T>, value: Option<NonNull<T>>) {
        slot.set(value);
        if let Some(target) = value {
            self.write_barrier(target.as_ptr() as Address);
        }
    }

    /// Store into a weak slot; weak slots need no barrier
    pub fn assign_weak<T: GarbageCollected>(&self, slot: &WeakMember<T>, value: Option<NonNull<T>>) {
        slot.set(value);
    }

    /// Insertion barrier for a reference to the object at `payload`
    ///
    /// While marking, the new target is marked (or recorded as not fully
    /// constructed) so a store into an already traced object is not lost.
    pub fn write_barrier(&self, payload: Address) {
        if payload == 0 || !self.flags.is_marking() {
            return;
        }
        let Some(worklists) = self.barrier_worklists.read().clone() else {
            return;
        };
        // SAFETY: `payload` is a heap object just stored into a slot.
        let header = unsafe { HeapObjectHeader::from_payload(payload) };
        if header.is_in_construction() {
            worklists.push_not_fully_constructed(header.address());
        } else if header.try_mark_atomic() {
            worklists.write_barrier.push(header.address());
        }
    }

    /// Strong root
    #[track_caller]
    pub fn persistent<T: GarbageCollected>(&self, object: Option<NonNull<T>>) -> Persistent<T> {
        Persistent::new_in(&self.roots.strong, object)
    }

    /// Root that is cleared when its target dies
    #[track_caller]
    pub fn weak_persistent<T: GarbageCollected>(&self, object: Option<NonNull<T>>) -> WeakPersistent<T> {
        WeakPersistent::new_in(&self.roots.weak, object)
    }

    /// Strong root that may be moved to and used from other threads
    #[track_caller]
    pub fn cross_thread_persistent<T: GarbageCollected>(
        &self,
        object: Option<NonNull<T>>,
    ) -> CrossThreadPersistent<T> {
        CrossThreadPersistent::new_in(&self.roots.cross_thread, object)
    }

    /// Weak root that may be moved to and used from other threads
    #[track_caller]
    pub fn weak_cross_thread_persistent<T: GarbageCollected>(
        &self,
        object: Option<NonNull<T>>,
    ) -> WeakCrossThreadPersistent<T> {
        WeakCrossThreadPersistent::new_in(&self.roots.cross_thread, object)
    }

    /// Source of conservative stack roots, `None` to scan nothing
    pub fn set_stack_scanner(&self, scanner: Option<Arc<dyn StackScanner>>) {
        *self.stack_scanner.write() = scanner;
    }

    // === Collection ===

    /// Run a full collection now
    ///
    /// Finishes a running incremental cycle instead of starting a new one.
    pub fn collect_garbage(&self, config: GcConfig) {
        if self.flags.is_gc_forbidden() {
            self.drop_request("collection requested in a no-GC scope");
            return;
        }
        if self.in_collection.swap(true, Ordering::AcqRel) {
            self.drop_request("collection already in progress");
            return;
        }
        let config = normalize(config);
        if self.marking.lock().is_none() {
            self.start_marking(config.with_marking_type(MarkingType::Atomic));
        }
        self.finish_garbage_collection(config);
        self.in_collection.store(false, Ordering::Release);
    }

    /// Start incremental marking
    ///
    /// Steps run from posted foreground tasks and from allocation. A cycle
    /// that is already running is left alone.
    pub fn start_incremental_garbage_collection(&self, config: GcConfig) {
        if self.flags.is_gc_forbidden() {
            self.drop_request("incremental start in a no-GC scope");
            return;
        }
        let marking_type = config.marking_type.min(self.config.marking_support);
        if marking_type == MarkingType::Atomic {
            log::debug!("Heap only supports atomic marking; incremental start ignored");
            return;
        }
        if self.in_collection.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.marking.lock().is_none() {
            self.start_marking(normalize(config).with_marking_type(marking_type));
            self.schedule_incremental_marking_task();
        }
        self.in_collection.store(false, Ordering::Release);
    }

    /// Finish a running incremental cycle with `config`
    pub fn finalize_incremental_garbage_collection_if_running(&self, config: GcConfig) {
        if self.is_marking() {
            self.collect_garbage(config);
        }
    }

    /// Run one bounded incremental marking step
    ///
    /// Returns true if marking has no work left (or is not running).
    pub fn incremental_marking_step(&self, budget: Duration) -> bool {
        let mut marking = self.marking.lock();
        let Some(cycle) = marking.as_mut() else {
            return true;
        };
        let stack = self.stack_scanner.read().clone();
        let cx = self.marking_context(stack.as_deref());
        cycle.marker.advance_marking_with_deadline(&cx, budget)
    }

    fn allocation_driven_marking_step(&self) {
        if self.flags.is_gc_forbidden() {
            return;
        }
        let done = {
            let Some(mut marking) = self.marking.try_lock() else {
                return;
            };
            let Some(cycle) = marking.as_mut() else {
                return;
            };
            let stack = self.stack_scanner.read().clone();
            let cx = self.marking_context(stack.as_deref());
            cycle
                .marker
                .advance_marking_with_deadline(&cx, self.config.incremental_marking_step)
        };
        if done {
            // Finalize from a task, where the stack holds no heap pointers
            self.schedule_incremental_marking_task();
        }
    }

    fn start_marking(&self, config: GcConfig) {
        self.sweeper.finish_if_running();

        let cycle = self.stats.collections() + 1;
        self.logger.log(GcEvent::CycleStart {
            cycle,
            marking: format!("{:?}", config.marking_type),
            reason: if config.is_forced { "forced" } else { "heap growing" }.to_string(),
        });
        log::info!("GC cycle {} started ({:?} marking)", cycle, config.marking_type);

        let mut marker = Marker::new(config.marking_type, self.config.marking_threads());
        self.flags.set_marking(true);
        *self.barrier_worklists.write() = Some(Arc::clone(marker.worklists()));
        {
            let stack = self.stack_scanner.read().clone();
            let cx = self.marking_context(stack.as_deref());
            marker.start_marking(&cx);
        }
        *self.marking.lock() = Some(MarkingCycle {
            marker,
            timer: GcTimer::new(),
            cycle,
        });
    }

    /// Atomic pause, then sweeping
    fn finish_garbage_collection(&self, config: GcConfig) {
        let Some(mut cycle) = self.marking.lock().take() else {
            return;
        };
        if let Some(task) = self.incremental_task.lock().take() {
            task.cancel();
        }
        let stack_state = self.override_stack_state.lock().unwrap_or(config.stack_state);

        let pause_timer = GcTimer::new();
        self.logger.log(GcEvent::PhaseStart {
            phase: "atomic pause".to_string(),
            cycle: cycle.cycle,
        });
        let result = {
            let _pause = self.flags.atomic_pause_scope();
            let stack = self.stack_scanner.read().clone();
            let cx = self.marking_context(stack.as_deref());
            cycle.marker.finish_marking(&cx, stack_state)
        };
        *self.barrier_worklists.write() = None;
        self.flags.set_marking(false);
        drop(cycle.marker);
        let pause = pause_timer.elapsed();

        self.stats.record_atomic_pause(pause);
        self.stats.notify_marking_completed(result.marked_bytes);
        self.epoch.fetch_add(1, Ordering::AcqRel);

        self.logger.log(GcEvent::AtomicPause {
            duration_us: pause.as_micros() as u64,
        });
        self.logger.log(GcEvent::CycleEnd {
            cycle: cycle.cycle,
            duration_ms: cycle.timer.elapsed_ms(),
            marked_bytes: result.marked_bytes,
        });
        self.logger.log(GcEvent::HeapLimitsUpdated {
            live_bytes: result.marked_bytes,
            atomic_limit: self.growing.limit_for_atomic_gc(),
            incremental_limit: self.growing.limit_for_incremental_gc(),
        });
        log::info!(
            "GC cycle {} marked {} live in {:?}",
            cycle.cycle,
            crate::util::debug::format_bytes(result.marked_bytes),
            pause
        );

        {
            let _no_allocation = self.flags.no_allocation_scope();
            self.prefinalizers.invoke_for_dead(&LivenessBroker::new());
        }

        let sweeping_type = config.sweeping_type.min(self.config.sweeping_support);
        self.sweeper.start(sweeping_type);
    }

    fn schedule_incremental_marking_task(&self) {
        let Some(runner) = self.platform.foreground_task_runner() else {
            return;
        };
        let mut pending = self.incremental_task.lock();
        if pending.as_ref().is_some_and(|handle| !handle.is_canceled()) {
            return;
        }
        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let heap = self.self_ref.clone();
        let budget = self.config.incremental_marking_step;
        let task = Box::new(move || {
            if task_handle.is_canceled() {
                return;
            }
            task_handle.cancel();
            let Some(heap) = heap.upgrade() else {
                return;
            };
            if heap.incremental_marking_step(budget) {
                heap.finalize_incremental_garbage_collection_if_running(
                    GcConfig::precise_atomic().with_sweeping_type(heap.config.sweeping_support),
                );
            } else {
                heap.schedule_incremental_marking_task();
            }
        });
        if runner.non_nestable_tasks_enabled() {
            runner.post_non_nestable_task(task);
        } else {
            runner.post_task(task);
        }
        *pending = Some(handle);
    }

    fn marking_context<'a>(&'a self, stack: Option<&'a dyn StackScanner>) -> MarkingContext<'a> {
        MarkingContext {
            raw_heap: &self.raw_heap,
            gc_info: &self.gc_info,
            roots: &self.roots,
            stack,
            platform: self.platform.as_ref(),
        }
    }

    fn drop_request(&self, reason: &str) {
        log::debug!("Ignoring GC request: {}", reason);
        self.logger.log(GcEvent::GcRequestDropped {
            reason: reason.to_string(),
        });
    }

    /// Complete any lazy or concurrent sweeping now
    pub fn finish_sweeping(&self) {
        self.sweeper.finish_if_running();
    }

    pub fn register_sweeping_observer(&self, observer: Arc<dyn SweepingObserver>) {
        self.sweeper.register_observer(observer);
    }

    pub fn no_garbage_collection_scope(&self) -> NoGarbageCollectionScope<'_> {
        self.flags.no_gc_scope()
    }

    // === Queries ===

    pub fn phase(&self) -> GcPhase {
        if self.flags.in_atomic_pause() {
            GcPhase::AtomicPause
        } else if self.flags.is_marking() {
            GcPhase::Marking
        } else if self.sweeper.is_sweeping() {
            GcPhase::Sweeping
        } else {
            GcPhase::Idle
        }
    }

    pub fn is_marking(&self) -> bool {
        self.flags.is_marking()
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_sweeping()
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics::collect(&self.stats, &self.raw_heap)
    }

    pub fn page_statistics(&self) -> Vec<PageStatistics> {
        collect_page_statistics(&self.raw_heap)
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn raw_heap(&self) -> &RawHeap {
        &self.raw_heap
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn logger(&self) -> &GcLogger {
        &self.logger
    }

    pub fn invoker(&self) -> &Arc<GcInvoker> {
        &self.invoker
    }

    pub fn growing(&self) -> &Arc<HeapGrowing> {
        &self.growing
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    pub fn roots(&self) -> &Roots {
        &self.roots
    }
}

/// The heap is not generational
fn normalize(config: GcConfig) -> GcConfig {
    if config.collection_type == CollectionType::Minor {
        log::debug!("Minor collection requested; running a major collection");
        return GcConfig {
            collection_type: CollectionType::Major,
            ..config
        };
    }
    config
}

impl GarbageCollector for Heap {
    fn collect_garbage(&self, config: GcConfig) {
        Heap::collect_garbage(self, config);
    }

    fn start_incremental_garbage_collection(&self, config: GcConfig) {
        Heap::start_incremental_garbage_collection(self, config);
    }

    fn epoch(&self) -> usize {
        Heap::epoch(self)
    }

    fn override_stack_state(&self) -> Option<StackState> {
        *self.override_stack_state.lock()
    }

    fn set_override_stack_state(&self, state: StackState) {
        *self.override_stack_state.lock() = Some(state);
    }

    fn clear_overridden_stack_state(&self) {
        let previous = self.override_stack_state.lock().take();
        debug_assert!(previous.is_some(), "no stack state override to clear");
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(task) = self.incremental_task.get_mut().take() {
            task.cancel();
        }
        if let Some(mut cycle) = self.marking.get_mut().take() {
            cycle.marker.cancel();
        }
        *self.barrier_worklists.get_mut() = None;
        self.flags.set_marking(false);
        self.sweeper.finish_if_running();

        // Without roots the final collection finalizes every object
        self.roots.clear_all();
        self.collect_garbage(
            GcConfig::precise_atomic()
                .with_sweeping_type(SweepingType::Atomic)
                .forced(),
        );
        self.sweeper.cancel_background_work();
        log::debug!(
            "Heap torn down: {} pages left, {} bytes committed",
            self.raw_heap.page_count(),
            self.raw_heap.backend().committed_bytes()
        );
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("phase", &self.phase())
            .field("epoch", &self.epoch())
            .field("raw_heap", &self.raw_heap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::Visitor;
    use crate::platform::DefaultPlatform;
    use std::sync::atomic::AtomicUsize;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked {
        next: Member<Tracked>,
    }

    impl GarbageCollected for Tracked {
        fn trace(&self, visitor: &mut dyn Visitor) {
            visitor.trace(&self.next);
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn heap() -> Arc<Heap> {
        let heap = Heap::new(HeapConfig::default(), Arc::new(DefaultPlatform::new())).unwrap();
        heap.growing().disable_for_testing();
        heap
    }

    #[test]
    fn test_flags_scopes_nest() {
        let flags = HeapFlags::default();
        let outer = flags.no_gc_scope();
        let inner = flags.no_gc_scope();
        drop(outer);
        assert!(flags.is_gc_forbidden());
        drop(inner);
        assert!(!flags.is_gc_forbidden());

        let no_alloc = flags.no_allocation_scope();
        assert!(!flags.is_allocation_allowed());
        assert!(flags.is_gc_forbidden());
        drop(no_alloc);
        assert!(flags.is_allocation_allowed());
    }

    #[test]
    fn test_collection_bumps_epoch() {
        let heap = heap();
        assert_eq!(heap.epoch(), 0);
        heap.collect_garbage(GcConfig::precise_atomic());
        assert_eq!(heap.epoch(), 1);
        assert_eq!(heap.phase(), GcPhase::Idle);
    }

    #[test]
    fn test_no_gc_scope_drops_requests() {
        let heap = heap();
        {
            let _scope = heap.no_garbage_collection_scope();
            heap.collect_garbage(GcConfig::precise_atomic());
        }
        assert_eq!(heap.epoch(), 0);
        assert!(heap
            .logger()
            .events()
            .iter()
            .any(|(_, e)| matches!(e, GcEvent::GcRequestDropped { .. })));
    }

    #[test]
    fn test_minor_request_runs_major() {
        let heap = heap();
        heap.collect_garbage(GcConfig {
            collection_type: CollectionType::Minor,
            ..GcConfig::precise_atomic()
        });
        assert_eq!(heap.epoch(), 1);
    }

    #[test]
    fn test_stack_state_override() {
        let heap = heap();
        let collector: &dyn GarbageCollector = heap.as_ref();
        collector.set_override_stack_state(StackState::NoHeapPointers);
        assert_eq!(collector.override_stack_state(), Some(StackState::NoHeapPointers));
        collector.clear_overridden_stack_state();
        assert_eq!(collector.override_stack_state(), None);
    }

    #[test]
    fn test_teardown_finalizes_everything() {
        let heap = heap();
        let before = DROPS.load(Ordering::SeqCst);
        let first = heap
            .make_garbage_collected(Tracked { next: Member::null() })
            .unwrap();
        let second = heap
            .make_garbage_collected(Tracked {
                next: Member::new(Some(first)),
            })
            .unwrap();
        let _root = heap.persistent(Some(second));

        drop(_root);
        drop(heap);
        assert!(DROPS.load(Ordering::SeqCst) >= before + 2);
    }
}
