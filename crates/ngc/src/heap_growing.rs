//! Heap Growing - Allocation-driven collection triggers
//!
//! Observes the allocated object size and asks the collector for a GC when
//! it crosses one of two limits:
//! - the incremental limit starts incremental marking
//! - the atomic limit forces a full atomic collection
//!
//! Both limits are recomputed each time marking finishes:
//! ```text
//! size        = max(allocated, initial_heap_size)
//! atomic      = max(size * growing_factor, size + MIN_LIMIT_INCREASE)
//! incremental = clamp(atomic - estimated_marking_time * allocation_speed,
//!                     size + min_ratio * (atomic - size),
//!                     size + max_ratio * (atomic - size))
//! ```
//! The clamp keeps the incremental limit from hugging either end: too close
//! to `atomic` and incremental marking never gets to run, too close to
//! `size` and the heap collects constantly.

use crate::config::{CollectionType, GcConfig, GrowingPolicy, HeapConfig, MarkingType, StackState, SweepingType};
use crate::gc::GarbageCollector;
use crate::heap::{NORMAL_PAGE_SIZE, NUMBER_OF_REGULAR_SPACES};
use crate::stats::{AllocationObserver, StatsCollector};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Smallest distance between the live size and the atomic limit
pub const MIN_LIMIT_INCREASE: usize = NORMAL_PAGE_SIZE * NUMBER_OF_REGULAR_SPACES;

/// Limits derived from a live size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowingLimits {
    pub atomic: usize,
    pub incremental: usize,
}

impl GrowingLimits {
    pub fn compute(policy: &GrowingPolicy, size: usize, allocation_speed_bytes_per_ms: f64) -> Self {
        let atomic = ((size as f64 * policy.growing_factor).ceil() as usize)
            .max(size.saturating_add(MIN_LIMIT_INCREASE));

        let marking_ms = policy.estimated_marking_time.as_secs_f64() * 1000.0;
        let estimated_during_marking = (marking_ms * allocation_speed_bytes_per_ms).ceil() as usize;
        let based_on_rate = atomic.saturating_sub(estimated_during_marking);

        let headroom = (atomic - size) as f64;
        let minimum = size + (headroom * policy.min_incremental_ratio) as usize;
        let maximum = size + (headroom * policy.max_incremental_ratio) as usize;

        Self {
            atomic,
            incremental: minimum.max(maximum.min(based_on_rate)),
        }
    }
}

pub struct HeapGrowing {
    collector: Weak<dyn GarbageCollector>,
    stats: Arc<StatsCollector>,
    policy: GrowingPolicy,
    initial_heap_size: usize,
    marking_support: MarkingType,
    sweeping_support: SweepingType,
    limit_for_atomic_gc: AtomicUsize,
    limit_for_incremental_gc: AtomicUsize,
    disabled_for_testing: AtomicBool,
}

impl HeapGrowing {
    pub fn new(
        collector: Weak<dyn GarbageCollector>,
        stats: Arc<StatsCollector>,
        config: &HeapConfig,
    ) -> Self {
        let growing = Self {
            collector,
            stats,
            policy: config.growing,
            initial_heap_size: config.initial_heap_size,
            marking_support: config.marking_support,
            sweeping_support: config.sweeping_support,
            limit_for_atomic_gc: AtomicUsize::new(0),
            limit_for_incremental_gc: AtomicUsize::new(0),
            disabled_for_testing: AtomicBool::new(false),
        };
        growing.configure_limit(config.initial_heap_size);
        growing
    }

    pub fn limit_for_atomic_gc(&self) -> usize {
        self.limit_for_atomic_gc.load(Ordering::Relaxed)
    }

    pub fn limit_for_incremental_gc(&self) -> usize {
        self.limit_for_incremental_gc.load(Ordering::Relaxed)
    }

    /// Stop triggering collections from allocation
    pub fn disable_for_testing(&self) {
        self.disabled_for_testing.store(true, Ordering::Relaxed);
    }

    fn configure_limit(&self, allocated_object_size: usize) {
        let size = allocated_object_size.max(self.initial_heap_size);
        let limits = GrowingLimits::compute(
            &self.policy,
            size,
            self.stats.allocation_speed_at_last_marking(),
        );
        self.limit_for_atomic_gc.store(limits.atomic, Ordering::Relaxed);
        self.limit_for_incremental_gc
            .store(limits.incremental, Ordering::Relaxed);
        log::trace!(
            "Heap limits for {} bytes: incremental {}, atomic {}",
            size,
            limits.incremental,
            limits.atomic
        );
    }
}

impl AllocationObserver for HeapGrowing {
    fn allocated_object_size_increased(&self, _bytes: usize) {
        if self.disabled_for_testing.load(Ordering::Relaxed) {
            return;
        }
        let Some(collector) = self.collector.upgrade() else {
            return;
        };
        let allocated = self.stats.allocated_object_size();
        if allocated > self.limit_for_atomic_gc() {
            collector.collect_garbage(GcConfig {
                collection_type: CollectionType::Major,
                stack_state: StackState::MayContainHeapPointers,
                marking_type: MarkingType::Atomic,
                sweeping_type: self.sweeping_support,
                is_forced: false,
            });
        } else if allocated > self.limit_for_incremental_gc() {
            if self.marking_support == MarkingType::Atomic {
                return;
            }
            collector.start_incremental_garbage_collection(GcConfig {
                collection_type: CollectionType::Major,
                stack_state: StackState::MayContainHeapPointers,
                marking_type: self.marking_support,
                sweeping_type: self.sweeping_support,
                is_forced: false,
            });
        }
    }

    fn reset_allocated_object_size(&self, marked_bytes: usize) {
        self.configure_limit(marked_bytes);
    }
}

impl std::fmt::Debug for HeapGrowing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapGrowing")
            .field("limit_for_incremental_gc", &self.limit_for_incremental_gc())
            .field("limit_for_atomic_gc", &self.limit_for_atomic_gc())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingCollector {
        atomic: Mutex<Vec<GcConfig>>,
        incremental: Mutex<Vec<GcConfig>>,
    }

    impl GarbageCollector for RecordingCollector {
        fn collect_garbage(&self, config: GcConfig) {
            self.atomic.lock().push(config);
        }
        fn start_incremental_garbage_collection(&self, config: GcConfig) {
            self.incremental.lock().push(config);
        }
        fn epoch(&self) -> usize {
            0
        }
        fn override_stack_state(&self) -> Option<StackState> {
            None
        }
        fn set_override_stack_state(&self, _state: StackState) {}
        fn clear_overridden_stack_state(&self) {}
    }

    fn setup(config: HeapConfig) -> (Arc<RecordingCollector>, Arc<StatsCollector>, Arc<HeapGrowing>) {
        let collector = Arc::new(RecordingCollector::default());
        let stats = Arc::new(StatsCollector::new());
        let weak: Weak<dyn GarbageCollector> = Arc::downgrade(&collector) as Weak<dyn GarbageCollector>;
        let growing = Arc::new(HeapGrowing::new(weak, stats.clone(), &config));
        stats.register_observer(growing.clone());
        (collector, stats, growing)
    }

    #[test]
    fn test_initial_limits_use_minimum_increase() {
        let (_, _, growing) = setup(HeapConfig::default());
        assert_eq!(growing.limit_for_atomic_gc(), MIN_LIMIT_INCREASE);
        assert!(growing.limit_for_incremental_gc() <= growing.limit_for_atomic_gc());
    }

    #[test]
    fn test_limits_scale_with_growing_factor() {
        let policy = GrowingPolicy::default();
        let limits = GrowingLimits::compute(&policy, 10 * MB, 0.0);

        assert_eq!(limits.atomic, 15 * MB);
        // No allocation: the rate-based limit equals atomic, capped at max ratio
        assert_eq!(limits.incremental, 10 * MB + (5.0 * MB as f64 * 0.9) as usize);
    }

    #[test]
    fn test_high_allocation_rate_hits_minimum_ratio() {
        let policy = GrowingPolicy {
            estimated_marking_time: Duration::from_millis(500),
            ..GrowingPolicy::default()
        };
        let limits = GrowingLimits::compute(&policy, 10 * MB, 1e9);
        assert_eq!(limits.incremental, 10 * MB + (5.0 * MB as f64 * 0.5) as usize);
    }

    #[test]
    fn test_limits_are_ordered_for_any_input() {
        let policy = GrowingPolicy::default();
        for size in [0, 1, 4096, MB, 100 * MB] {
            for speed in [0.0, 1.0, 1e3, 1e6, 1e12] {
                let limits = GrowingLimits::compute(&policy, size, speed);
                assert!(limits.atomic >= size + MIN_LIMIT_INCREASE);
                assert!(limits.incremental >= size);
                assert!(limits.incremental <= limits.atomic);
            }
        }
    }

    #[test]
    fn test_atomic_limit_triggers_conservative_atomic_gc() {
        let (collector, stats, growing) = setup(HeapConfig::default());

        stats.notify_allocation(growing.limit_for_atomic_gc() + 1);

        let atomic = collector.atomic.lock();
        assert_eq!(atomic.len(), 1);
        assert_eq!(atomic[0].marking_type, MarkingType::Atomic);
        assert_eq!(atomic[0].stack_state, StackState::MayContainHeapPointers);
        assert_eq!(atomic[0].collection_type, CollectionType::Major);
    }

    #[test]
    fn test_incremental_limit_starts_incremental_gc() {
        let (collector, stats, growing) = setup(HeapConfig::default());

        stats.notify_allocation(growing.limit_for_incremental_gc() + 1);

        assert!(collector.atomic.lock().is_empty());
        let incremental = collector.incremental.lock();
        assert_eq!(incremental.len(), 1);
        assert_eq!(incremental[0].marking_type, MarkingType::IncrementalAndConcurrent);
    }

    #[test]
    fn test_atomic_marking_support_never_starts_incremental() {
        let config = HeapConfig {
            marking_support: MarkingType::Atomic,
            ..HeapConfig::default()
        };
        let (collector, stats, growing) = setup(config);

        stats.notify_allocation(growing.limit_for_incremental_gc() + 1);
        assert!(collector.incremental.lock().is_empty());
    }

    #[test]
    fn test_disabled_for_testing() {
        let (collector, stats, growing) = setup(HeapConfig::default());
        growing.disable_for_testing();

        stats.notify_allocation(growing.limit_for_atomic_gc() * 2);
        assert!(collector.atomic.lock().is_empty());
    }

    #[test]
    fn test_reset_reconfigures_limits() {
        let config = HeapConfig {
            initial_heap_size: 0,
            ..HeapConfig::default()
        };
        let (_, stats, growing) = setup(config);

        stats.notify_marking_completed(10 * MB);
        assert_eq!(growing.limit_for_atomic_gc(), 15 * MB);
    }

    #[test]
    fn test_reset_uses_speed_of_finished_cycle() {
        let config = HeapConfig {
            initial_heap_size: 0,
            ..HeapConfig::default()
        };
        let (_, stats, growing) = setup(config);
        growing.disable_for_testing();

        stats.notify_allocation(1 << 30);
        stats.notify_marking_completed(10 * MB);

        assert_eq!(growing.limit_for_incremental_gc(), 10 * MB + (5.0 * MB as f64 * 0.5) as usize);
    }
}
