//! Platform - Capabilities provided by the embedder
//!
//! The heap never spawns work on its own. It asks the [`Platform`] for:
//! - a foreground task runner, for incremental steps and deferred
//!   collections on the mutator thread
//! - background jobs, for concurrent marking and sweeping
//! - whether the mutator stack can be scanned conservatively
//!
//! [`DefaultPlatform`] runs foreground tasks from an explicit message loop
//! ([`DefaultPlatform::pump_message_loop`]) and background jobs on named
//! threads.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work item for a task runner
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Body of a background job, run once per worker thread
pub type JobTask = Arc<dyn Fn(&JobDelegate) + Send + Sync + 'static>;

/// Runs tasks on the mutator thread
pub trait TaskRunner: Send + Sync {
    fn post_task(&self, task: Task);

    /// Post a task that must not run from a nested message loop
    fn post_non_nestable_task(&self, task: Task);

    fn non_nestable_tasks_enabled(&self) -> bool;
}

pub trait Platform: Send + Sync {
    fn foreground_task_runner(&self) -> Option<Arc<dyn TaskRunner>>;

    /// Whether the mutator stack may be scanned for heap pointers
    fn supports_conservative_stack_scan(&self) -> bool;

    /// Start `workers` threads running `job`
    fn post_job(&self, name: &str, workers: usize, job: JobTask) -> JobHandle {
        JobHandle::spawn(name, workers, job)
    }
}

/// Cancelable handle to a posted task
///
/// The task itself checks the flag when it runs.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    canceled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Passed to each worker of a job
pub struct JobDelegate {
    worker_id: usize,
    canceled: Arc<AtomicBool>,
}

impl JobDelegate {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Whether the worker should stop at the next safe point
    #[inline]
    pub fn should_yield(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Owner of a running background job
///
/// Dropping the handle cancels and joins the job.
pub struct JobHandle {
    canceled: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl JobHandle {
    /// Spawn `workers` named threads running `job`
    pub fn spawn(name: &str, workers: usize, job: JobTask) -> Self {
        let canceled = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(workers);
        for worker_id in 0..workers.max(1) {
            let job = Arc::clone(&job);
            let delegate = JobDelegate {
                worker_id,
                canceled: Arc::clone(&canceled),
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || job(&delegate));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => log::warn!("Failed to spawn {} worker {}: {}", name, worker_id, e),
            }
        }
        Self { canceled, threads }
    }

    /// Handle with no workers, for platforms that run jobs inline
    pub fn finished() -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(true)),
            threads: Vec::new(),
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn join(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Background GC worker panicked");
            }
        }
    }

    pub fn cancel_and_join(&mut self) {
        self.cancel();
        self.join();
    }

    /// Whether any worker is still running
    pub fn is_active(&self) -> bool {
        self.threads.iter().any(|handle| !handle.is_finished())
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("workers", &self.threads.len())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Queue backing the default foreground task runner
pub struct ForegroundTaskQueue {
    tasks: Mutex<VecDeque<(Task, bool)>>,
    non_nestable_enabled: AtomicBool,
    nesting: AtomicUsize,
}

impl ForegroundTaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            non_nestable_enabled: AtomicBool::new(true),
            nesting: AtomicUsize::new(0),
        }
    }

    pub fn set_non_nestable_tasks_enabled(&self, enabled: bool) {
        self.non_nestable_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run one task; non-nestable tasks are skipped inside a running task
    pub fn run_one(&self) -> bool {
        let nested = self.nesting.load(Ordering::Relaxed) > 0;
        let task = {
            let mut tasks = self.tasks.lock();
            let position = if nested {
                tasks.iter().position(|(_, non_nestable)| !non_nestable)
            } else if tasks.is_empty() {
                None
            } else {
                Some(0)
            };
            position.and_then(|p| tasks.remove(p))
        };
        match task {
            Some((task, _)) => {
                self.nesting.fetch_add(1, Ordering::Relaxed);
                task();
                self.nesting.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

impl Default for ForegroundTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for ForegroundTaskQueue {
    fn post_task(&self, task: Task) {
        self.tasks.lock().push_back((task, false));
    }

    fn post_non_nestable_task(&self, task: Task) {
        self.tasks.lock().push_back((task, true));
    }

    fn non_nestable_tasks_enabled(&self) -> bool {
        self.non_nestable_enabled.load(Ordering::Relaxed)
    }
}

/// Platform with a pumpable foreground queue and thread-backed jobs
pub struct DefaultPlatform {
    queue: Option<Arc<ForegroundTaskQueue>>,
    stack_scan: bool,
}

impl DefaultPlatform {
    /// Foreground queue enabled, no conservative stack scanning
    pub fn new() -> Self {
        Self {
            queue: Some(Arc::new(ForegroundTaskQueue::new())),
            stack_scan: false,
        }
    }

    /// Platform without a foreground task runner
    pub fn without_task_runner() -> Self {
        Self {
            queue: None,
            stack_scan: false,
        }
    }

    pub fn with_stack_scan_support(mut self, supported: bool) -> Self {
        self.stack_scan = supported;
        self
    }

    pub fn task_queue(&self) -> Option<&Arc<ForegroundTaskQueue>> {
        self.queue.as_ref()
    }

    /// Run one pending foreground task
    pub fn pump_message_loop(&self) -> bool {
        self.queue.as_ref().is_some_and(|queue| queue.run_one())
    }

    /// Run foreground tasks until the queue is empty
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.pump_message_loop() {
            ran += 1;
        }
        ran
    }
}

impl Default for DefaultPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for DefaultPlatform {
    fn foreground_task_runner(&self) -> Option<Arc<dyn TaskRunner>> {
        self.queue
            .as_ref()
            .map(|queue| Arc::clone(queue) as Arc<dyn TaskRunner>)
    }

    fn supports_conservative_stack_scan(&self) -> bool {
        self.stack_scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_handle_cancel_is_shared() {
        let handle = TaskHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_canceled());
    }

    #[test]
    fn test_pump_runs_tasks_in_order() {
        let platform = DefaultPlatform::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = platform.foreground_task_runner().unwrap();
        for i in 0..3 {
            let log = log.clone();
            runner.post_task(Box::new(move || log.lock().push(i)));
        }

        assert_eq!(platform.run_until_idle(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(!platform.pump_message_loop());
    }

    #[test]
    fn test_non_nestable_task_waits_for_outer_loop() {
        let platform = Arc::new(DefaultPlatform::new());
        let runner = platform.foreground_task_runner().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        runner.post_task(Box::new({
            let platform = platform.clone();
            let order = order.clone();
            move || {
                order.lock().push("outer");
                let ran = platform.pump_message_loop();
                order.lock().push(if ran { "nested ran" } else { "nested skipped" });
            }
        }));
        runner.post_non_nestable_task(Box::new({
            let order = order.clone();
            move || order.lock().push("non-nestable")
        }));

        platform.run_until_idle();
        assert_eq!(*order.lock(), vec!["outer", "nested skipped", "non-nestable"]);
    }

    #[test]
    fn test_job_workers_stop_on_cancel() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = iterations.clone();
        let mut handle = JobHandle::spawn(
            "test-job",
            2,
            Arc::new(move |delegate: &JobDelegate| {
                while !delegate.should_yield() {
                    counter.fetch_add(1, Ordering::Relaxed);
                    std::thread::yield_now();
                }
            }),
        );

        while iterations.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }
        handle.cancel_and_join();
        assert!(!handle.is_active());
    }
}
