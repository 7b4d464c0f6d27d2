//! Sweeper Module - Reclaiming dead objects
//!
//! Sweeping starts right after marking. Every page is swept exactly once
//! per cycle, by one of:
//! - the mutator, atomically inside the collection
//! - the mutator, lazily from the allocation slow path or a foreground task
//! - a background job, with finalization left to the mutator
//!
//! Page States:
//! ```text
//! Unswept ──(mutator)──────────────────────────────┐
//!    │                                             ▼
//!    └──(background)──► SweptUnfinalized ──► Reclaimed into free list
//!                                          └► Released (empty page)
//! ```
//!
//! Sweeping is complete once every space has no unswept page, no page
//! waiting for finalization, and no page in flight on a background worker.
//! Observers are told exactly once per cycle.

pub mod page;

pub use page::{sweep_page, SweepMode, SweptPageState};

use crate::config::SweepingType;
use crate::gc::HeapFlags;
use crate::heap::{BasePage, PageRelease, RawHeap};
use crate::object::gc_info::GcInfoTable;
use crate::platform::{JobDelegate, JobHandle, Platform, TaskHandle};
use crate::stats::timer::Deadline;
use crate::stats::{StatsCollector, SweepStats};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Notified when a sweeping cycle completes
pub trait SweepingObserver: Send + Sync {
    fn sweeping_completed(&self, stats: &SweepStats);
}

#[derive(Default)]
struct SpaceSweepState {
    unswept: Mutex<Vec<Arc<BasePage>>>,
    swept_unfinalized: Mutex<Vec<SweptPageState>>,
}

/// State shared with the background job
struct SweeperShared {
    gc_info: Arc<GcInfoTable>,
    spaces: Vec<SpaceSweepState>,
    in_flight: AtomicUsize,
}

impl SweeperShared {
    fn pop_unswept(&self, space: usize) -> Option<Arc<BasePage>> {
        self.spaces[space].unswept.lock().pop()
    }

    fn pop_unswept_for_background(&self, space: usize) -> Option<Arc<BasePage>> {
        let mut unswept = self.spaces[space].unswept.lock();
        let page = unswept.pop();
        if page.is_some() {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        page
    }

    fn pop_swept(&self, space: usize) -> Option<SweptPageState> {
        self.spaces[space].swept_unfinalized.lock().pop()
    }

    fn is_out_of_work(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
            && self.spaces.iter().all(|space| {
                space.unswept.lock().is_empty() && space.swept_unfinalized.lock().is_empty()
            })
    }
}

/// Tuning for one sweeper
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub sweeping_threads: usize,
    pub incremental_step: Duration,
}

pub struct Sweeper {
    raw_heap: Arc<RawHeap>,
    stats: Arc<StatsCollector>,
    platform: Arc<dyn Platform>,
    flags: Arc<HeapFlags>,
    config: SweeperConfig,
    shared: Arc<SweeperShared>,
    in_progress: AtomicBool,
    sweeping_type: Mutex<SweepingType>,
    cycle_stats: Mutex<SweepStats>,
    observers: Mutex<Vec<Arc<dyn SweepingObserver>>>,
    job: Mutex<Option<JobHandle>>,
    foreground_task: Mutex<Option<TaskHandle>>,
    self_ref: Weak<Sweeper>,
}

impl Sweeper {
    pub fn new(
        raw_heap: Arc<RawHeap>,
        gc_info: Arc<GcInfoTable>,
        stats: Arc<StatsCollector>,
        platform: Arc<dyn Platform>,
        flags: Arc<HeapFlags>,
        config: SweeperConfig,
    ) -> Arc<Self> {
        let spaces = raw_heap
            .spaces()
            .iter()
            .map(|_| SpaceSweepState::default())
            .collect();
        Arc::new_cyclic(|self_ref| Self {
            raw_heap,
            stats,
            platform,
            flags,
            config,
            shared: Arc::new(SweeperShared {
                gc_info,
                spaces,
                in_flight: AtomicUsize::new(0),
            }),
            in_progress: AtomicBool::new(false),
            sweeping_type: Mutex::new(SweepingType::Atomic),
            cycle_stats: Mutex::new(SweepStats::default()),
            observers: Mutex::new(Vec::new()),
            job: Mutex::new(None),
            foreground_task: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn is_sweeping(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn register_observer(&self, observer: Arc<dyn SweepingObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn SweepingObserver>) {
        self.observers
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    /// Begin sweeping after marking finished
    pub fn start(&self, sweeping_type: SweepingType) {
        if self.is_sweeping() {
            self.finish_if_running();
        }
        *self.cycle_stats.lock() = SweepStats::default();
        *self.sweeping_type.lock() = sweeping_type;

        if sweeping_type == SweepingType::None {
            self.unmark_all();
            self.notify_completion();
            return;
        }

        self.raw_heap.reset_linear_allocation_buffers();
        for (index, space) in self.raw_heap.spaces().iter().enumerate() {
            space.lock().free_list.clear();
            let pages = self.raw_heap.pages_of(space);
            *self.shared.spaces[index].unswept.lock() = pages;
        }
        self.in_progress.store(true, Ordering::Release);
        log::debug!("Sweeping started ({:?})", sweeping_type);

        match sweeping_type {
            SweepingType::None | SweepingType::Atomic => {
                self.finish_if_running();
            }
            SweepingType::Incremental => self.schedule_foreground_task(),
            SweepingType::IncrementalAndConcurrent => {
                self.start_background_job();
                self.schedule_foreground_task();
            }
        }
    }

    /// Complete every outstanding page now
    pub fn finish_if_running(&self) {
        if !self.is_sweeping() {
            return;
        }
        // Pages in flight must land before the mutator takes over
        if let Some(mut job) = self.job.lock().take() {
            job.cancel_and_join();
        }
        for space in 0..self.shared.spaces.len() {
            self.finalize_swept_pages(space, &Deadline::never(), None);
            self.sweep_unswept_pages(space, &Deadline::never(), None);
        }
        self.finish_if_out_of_work();
    }

    /// Sweep `space` until a block of `size` bytes is free or `budget` ends
    ///
    /// Returns true if the space's free list can now serve `size`.
    pub fn sweep_for_allocation_if_running(&self, space: usize, size: usize, budget: Duration) -> bool {
        if !self.is_sweeping() {
            return false;
        }
        let deadline = Deadline::after(budget);
        let found = self.finalize_swept_pages(space, &deadline, Some(size))
            || self.sweep_unswept_pages(space, &deadline, Some(size));
        self.finish_if_out_of_work();
        found
    }

    /// Complete the cycle if no work is left anywhere
    pub fn finish_if_out_of_work(&self) -> bool {
        if !self.is_sweeping() || !self.shared.is_out_of_work() {
            return false;
        }
        if let Some(mut job) = self.job.lock().take() {
            job.cancel_and_join();
        }
        if let Some(task) = self.foreground_task.lock().take() {
            task.cancel();
        }
        self.notify_completion();
        true
    }

    /// One bounded foreground step; true if sweeping completed
    pub fn perform_sweep_step(&self, budget: Duration) -> bool {
        if !self.is_sweeping() {
            return true;
        }
        let deadline = Deadline::after(budget);
        for space in 0..self.shared.spaces.len() {
            self.finalize_swept_pages(space, &deadline, None);
            self.sweep_unswept_pages(space, &deadline, None);
            if deadline.is_reached() {
                break;
            }
        }
        self.finish_if_out_of_work()
    }

    /// Drop the current cycle's background work and finish on the mutator
    pub fn cancel_background_work(&self) {
        if let Some(mut job) = self.job.lock().take() {
            job.cancel_and_join();
        }
        if let Some(task) = self.foreground_task.lock().take() {
            task.cancel();
        }
    }

    /// Finalize background-swept pages; true once a block of `size` appears
    fn finalize_swept_pages(&self, space: usize, deadline: &Deadline, size: Option<usize>) -> bool {
        while let Some(mut swept) = self.shared.pop_swept(space) {
            let largest = self.apply_swept_page(&mut swept);
            if size.is_some_and(|size| largest >= size) {
                return true;
            }
            if deadline.is_reached() {
                return false;
            }
        }
        false
    }

    fn sweep_unswept_pages(&self, space: usize, deadline: &Deadline, size: Option<usize>) -> bool {
        while let Some(page) = self.shared.pop_unswept(space) {
            let mut swept = {
                let _no_allocation = self.flags.no_allocation_scope();
                sweep_page(page, &self.shared.gc_info, SweepMode::Inline)
            };
            let largest = self.apply_swept_page(&mut swept);
            if size.is_some_and(|size| largest >= size) {
                return true;
            }
            if deadline.is_reached() {
                return false;
            }
        }
        false
    }

    /// Finalize and publish a swept page; returns its largest new block
    fn apply_swept_page(&self, swept: &mut SweptPageState) -> usize {
        if swept.needs_finalization() {
            let _no_allocation = self.flags.no_allocation_scope();
            swept.finalize(&self.shared.gc_info);
        }

        let mut cycle = self.cycle_stats.lock();
        cycle.pages_swept += 1;
        cycle.objects_finalized += swept.objects_finalized;
        cycle.bytes_reclaimed += swept.swept_unmarked_size;
        drop(cycle);

        if swept.is_empty {
            let release = self.raw_heap.release_page(&swept.page);
            let mut cycle = self.cycle_stats.lock();
            match release {
                PageRelease::Pooled => cycle.pages_pooled += 1,
                PageRelease::Destroyed => cycle.pages_destroyed += 1,
            }
            return 0;
        }

        let space = self.raw_heap.space(swept.page.space_index());
        space
            .lock()
            .free_list
            .append(&mut swept.cached_free_list);
        swept.largest_new_free_list_entry
    }

    fn unmark_all(&self) {
        for space in self.raw_heap.spaces() {
            for page in self.raw_heap.pages_of(space) {
                page.iterate_headers(|header| {
                    if !header.is_free() {
                        header.unmark();
                    }
                });
            }
        }
    }

    fn notify_completion(&self) {
        self.in_progress.store(false, Ordering::Release);
        let stats = *self.cycle_stats.lock();
        self.stats.notify_sweeping_completed(&stats);
        log::debug!(
            "Sweeping completed: {} pages, {} finalized, {} bytes reclaimed",
            stats.pages_swept,
            stats.objects_finalized,
            stats.bytes_reclaimed
        );
        let observers = self.observers.lock().clone();
        for observer in observers.iter() {
            observer.sweeping_completed(&stats);
        }
    }

    fn start_background_job(&self) {
        let shared = Arc::clone(&self.shared);
        let job = self.platform.post_job(
            "ngc-sweeper",
            self.config.sweeping_threads,
            Arc::new(move |delegate: &JobDelegate| sweep_in_background(&shared, delegate)),
        );
        *self.job.lock() = Some(job);
    }

    fn schedule_foreground_task(&self) {
        let Some(runner) = self.platform.foreground_task_runner() else {
            return;
        };
        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let weak = self.self_ref.clone();
        let budget = self.config.incremental_step;
        runner.post_task(Box::new(move || {
            if task_handle.is_canceled() {
                return;
            }
            let Some(sweeper) = weak.upgrade() else {
                return;
            };
            if !sweeper.perform_sweep_step(budget) {
                sweeper.schedule_foreground_task();
            }
        }));
        if let Some(previous) = self.foreground_task.lock().replace(handle) {
            previous.cancel();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(mut job) = self.job.get_mut().take() {
            job.cancel_and_join();
        }
        if let Some(task) = self.foreground_task.get_mut().take() {
            task.cancel();
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("in_progress", &self.is_sweeping())
            .field("sweeping_type", &*self.sweeping_type.lock())
            .finish()
    }
}

fn sweep_in_background(shared: &SweeperShared, delegate: &JobDelegate) {
    let mut swept_pages = 0;
    for space in 0..shared.spaces.len() {
        loop {
            if delegate.should_yield() {
                return;
            }
            let Some(page) = shared.pop_unswept_for_background(space) else {
                break;
            };
            let swept = sweep_page(page, &shared.gc_info, SweepMode::Deferred);
            shared.spaces[space].swept_unfinalized.lock().push(swept);
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            swept_pages += 1;
        }
    }
    log::trace!(
        "Sweeper worker {} done after {} pages",
        delegate.worker_id(),
        swept_pages
    );
}
