//! Stats Module - Heap accounting
//!
//! The [`StatsCollector`] is the single source of truth for how many object
//! bytes are allocated. Allocation, explicit frees and the end of marking
//! report to it; it forwards each change to registered
//! [`AllocationObserver`]s, which is how heap growing and allocation-driven
//! marking steps find out about allocation.
//!
//! Metrics:
//! - Allocated object size (marked at last GC + allocated since)
//! - Allocation speed since the end of the last marking
//! - Atomic pause histogram
//! - Sweeping totals (pages pooled or destroyed, finalizers run)

pub mod histogram;
pub mod timer;

pub use histogram::{Histogram, HistogramSummary};
pub use timer::{Deadline, GcTimer};

use crate::heap::RawHeap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receives allocated-object-size changes
///
/// Called synchronously on the thread that changed the size, with no heap
/// lock held. Implementations may start a collection.
pub trait AllocationObserver: Send + Sync {
    fn allocated_object_size_increased(&self, bytes: usize);

    fn allocated_object_size_decreased(&self, _bytes: usize) {}

    /// Marking finished with `marked_bytes` live
    fn reset_allocated_object_size(&self, _marked_bytes: usize) {}
}

/// Totals of one sweeping cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub pages_swept: usize,
    pub pages_pooled: usize,
    pub pages_destroyed: usize,
    pub objects_finalized: usize,
    pub bytes_reclaimed: usize,
}

pub struct StatsCollector {
    marked_bytes_at_last_gc: AtomicUsize,
    allocated_since_marking: AtomicI64,
    explicitly_freed_bytes: AtomicUsize,
    marking_end: Mutex<Instant>,
    // f64 bits
    allocation_speed_at_last_marking: AtomicU64,
    observers: RwLock<Vec<Arc<dyn AllocationObserver>>>,
    pause_histogram: Histogram,
    collections: AtomicU64,
    pages_pooled: AtomicUsize,
    pages_destroyed: AtomicUsize,
    objects_finalized: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            marked_bytes_at_last_gc: AtomicUsize::new(0),
            allocated_since_marking: AtomicI64::new(0),
            explicitly_freed_bytes: AtomicUsize::new(0),
            marking_end: Mutex::new(Instant::now()),
            allocation_speed_at_last_marking: AtomicU64::new(0f64.to_bits()),
            observers: RwLock::new(Vec::new()),
            pause_histogram: Histogram::new(),
            collections: AtomicU64::new(0),
            pages_pooled: AtomicUsize::new(0),
            pages_destroyed: AtomicUsize::new(0),
            objects_finalized: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.observers.write().push(observer);
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.observers
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, observer));
    }

    // Observers may trigger a GC that reports back here, so iterate a
    // snapshot instead of holding the lock.
    fn for_each_observer(&self, f: impl Fn(&dyn AllocationObserver)) {
        let observers = self.observers.read_recursive().clone();
        for observer in observers.iter() {
            f(observer.as_ref());
        }
    }

    pub fn notify_allocation(&self, bytes: usize) {
        self.allocated_since_marking
            .fetch_add(bytes as i64, Ordering::Relaxed);
        self.for_each_observer(|o| o.allocated_object_size_increased(bytes));
    }

    pub fn notify_explicit_free(&self, bytes: usize) {
        self.allocated_since_marking
            .fetch_sub(bytes as i64, Ordering::Relaxed);
        self.explicitly_freed_bytes
            .fetch_add(bytes, Ordering::Relaxed);
        self.for_each_observer(|o| o.allocated_object_size_decreased(bytes));
    }

    /// Marking finished; live size becomes the new baseline
    ///
    /// The allocation speed of the cycle that just ended is latched before
    /// the counters reset, so observers see it through
    /// [`allocation_speed_at_last_marking`](Self::allocation_speed_at_last_marking).
    pub fn notify_marking_completed(&self, marked_bytes: usize) {
        self.allocation_speed_at_last_marking
            .store(self.allocation_speed_bytes_per_ms().to_bits(), Ordering::Relaxed);
        self.marked_bytes_at_last_gc
            .store(marked_bytes, Ordering::Relaxed);
        self.allocated_since_marking.store(0, Ordering::Relaxed);
        self.explicitly_freed_bytes.store(0, Ordering::Relaxed);
        *self.marking_end.lock() = Instant::now();
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.for_each_observer(|o| o.reset_allocated_object_size(marked_bytes));
    }

    pub fn notify_sweeping_completed(&self, stats: &SweepStats) {
        self.pages_pooled
            .fetch_add(stats.pages_pooled, Ordering::Relaxed);
        self.pages_destroyed
            .fetch_add(stats.pages_destroyed, Ordering::Relaxed);
        self.objects_finalized
            .fetch_add(stats.objects_finalized, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(stats.bytes_reclaimed, Ordering::Relaxed);
    }

    pub fn record_atomic_pause(&self, pause: Duration) {
        self.pause_histogram.record(pause.as_micros() as u64);
    }

    /// Bytes of objects considered allocated right now
    pub fn allocated_object_size(&self) -> usize {
        let marked = self.marked_bytes_at_last_gc.load(Ordering::Relaxed) as i64;
        let since = self.allocated_since_marking.load(Ordering::Relaxed);
        (marked + since).max(0) as usize
    }

    pub fn marked_bytes_at_last_gc(&self) -> usize {
        self.marked_bytes_at_last_gc.load(Ordering::Relaxed)
    }

    pub fn explicitly_freed_bytes(&self) -> usize {
        self.explicitly_freed_bytes.load(Ordering::Relaxed)
    }

    /// Net bytes allocated per millisecond since the last marking finished
    pub fn allocation_speed_bytes_per_ms(&self) -> f64 {
        let elapsed_ms = self.marking_end.lock().elapsed().as_secs_f64() * 1000.0;
        let since = self.allocated_since_marking.load(Ordering::Relaxed);
        if elapsed_ms <= 0.0 || since <= 0 {
            return 0.0;
        }
        since as f64 / elapsed_ms
    }

    /// Allocation speed measured over the cycle ended by the last marking
    pub fn allocation_speed_at_last_marking(&self) -> f64 {
        f64::from_bits(self.allocation_speed_at_last_marking.load(Ordering::Relaxed))
    }

    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    pub fn pause_histogram(&self) -> &Histogram {
        &self.pause_histogram
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsCollector")
            .field("allocated_object_size", &self.allocated_object_size())
            .field("collections", &self.collections())
            .finish()
    }
}

/// Usage of one page
#[derive(Debug, Clone, Serialize)]
pub struct PageStatistics {
    pub space: String,
    pub large: bool,
    /// Payload bytes
    pub page_size: usize,
    /// Bytes of objects (header included)
    pub live_bytes: usize,
    /// Everything else: free blocks, fillers, buffer remainder
    pub free_bytes: usize,
}

/// Serializable snapshot of a heap
#[derive(Debug, Clone, Serialize)]
pub struct HeapStatistics {
    pub allocated_object_size: usize,
    pub marked_bytes_at_last_gc: usize,
    pub committed_bytes: usize,
    pub pooled_pages: usize,
    pub page_count: usize,
    pub collections: u64,
    pub pages_pooled: usize,
    pub pages_destroyed: usize,
    pub objects_finalized: usize,
    pub bytes_reclaimed: usize,
    pub atomic_pause_us: HistogramSummary,
}

impl HeapStatistics {
    pub fn collect(stats: &StatsCollector, raw_heap: &RawHeap) -> Self {
        Self {
            allocated_object_size: stats.allocated_object_size(),
            marked_bytes_at_last_gc: stats.marked_bytes_at_last_gc(),
            committed_bytes: raw_heap.backend().committed_bytes(),
            pooled_pages: raw_heap.backend().pooled_pages(),
            page_count: raw_heap.page_count(),
            collections: stats.collections(),
            pages_pooled: stats.pages_pooled.load(Ordering::Relaxed),
            pages_destroyed: stats.pages_destroyed.load(Ordering::Relaxed),
            objects_finalized: stats.objects_finalized.load(Ordering::Relaxed),
            bytes_reclaimed: stats.bytes_reclaimed.load(Ordering::Relaxed),
            atomic_pause_us: stats.pause_histogram.summary(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Walk every page and report used and free bytes
///
/// Must not run concurrently with sweeping.
pub fn collect_page_statistics(raw_heap: &RawHeap) -> Vec<PageStatistics> {
    let mut result = Vec::new();
    for space in raw_heap.spaces() {
        for page in raw_heap.pages_of(space) {
            let mut live_bytes = 0;
            page.iterate_headers(|header| {
                if !header.is_free() {
                    live_bytes += header.allocated_size();
                }
            });
            result.push(PageStatistics {
                space: space.name().to_string(),
                large: page.is_large(),
                page_size: page.payload_size(),
                live_bytes,
                free_bytes: page.payload_size() - live_bytes,
            });
        }
    }
    result
}
