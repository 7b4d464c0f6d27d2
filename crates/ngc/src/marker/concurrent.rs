//! Concurrent Marker - Background marking threads
//!
//! Workers steal from the shared marking worklist while the mutator runs.
//! Anything a worker cannot finish (objects that refuse concurrent tracing,
//! objects under construction, weak work) lands in the shared worklists and
//! is handled by the mutator.
//!
//! ## Termination
//!
//! Workers never decide that marking is done. They run until the mutator
//! cancels the job at the atomic pause. [`ConcurrentMarker::is_idle`] lets
//! incremental steps know the background has nothing in flight.

use crate::marker::marking_state::MarkingState;
use crate::marker::marking_visitor::MarkingVisitor;
use crate::marker::worklists::MarkingWorklists;
use crate::object::header::HeapObjectHeader;
use crate::platform::{JobDelegate, JobHandle, Platform};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SPIN_ITERATIONS: usize = 64;
const MIN_SLEEP_US: u64 = 10;
const MAX_SLEEP_US: u64 = 500;

struct SharedState {
    worklists: Arc<MarkingWorklists>,
    marked_bytes: AtomicUsize,
    in_flight: AtomicUsize,
    processed: AtomicUsize,
}

pub struct ConcurrentMarker {
    shared: Arc<SharedState>,
    job: Option<JobHandle>,
}

impl ConcurrentMarker {
    pub fn start(platform: &dyn Platform, worklists: Arc<MarkingWorklists>, workers: usize) -> Self {
        let shared = Arc::new(SharedState {
            worklists,
            marked_bytes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
        });
        let job_shared = Arc::clone(&shared);
        let job = platform.post_job(
            "ngc-marker",
            workers,
            Arc::new(move |delegate: &JobDelegate| run_worker(&job_shared, delegate)),
        );
        log::debug!("Started concurrent marking with {} workers", workers);
        Self {
            shared,
            job: Some(job),
        }
    }

    /// No worker is tracing and the shared worklist is empty
    pub fn is_idle(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire) == 0
            && self.shared.worklists.marking_is_empty()
    }

    /// Bytes marked by workers that already exited
    pub fn marked_bytes(&self) -> usize {
        self.shared.marked_bytes.load(Ordering::Acquire)
    }

    pub fn processed_objects(&self) -> usize {
        self.shared.processed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }

    /// Stop the workers and wait for them to publish their counters
    pub fn cancel_and_join(&mut self) {
        if let Some(mut job) = self.job.take() {
            job.cancel_and_join();
            log::debug!(
                "Concurrent marking stopped: {} objects, {} bytes",
                self.processed_objects(),
                self.marked_bytes()
            );
        }
    }
}

impl Drop for ConcurrentMarker {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}

impl std::fmt::Debug for ConcurrentMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMarker")
            .field("running", &self.is_running())
            .field("marked_bytes", &self.marked_bytes())
            .finish()
    }
}

fn run_worker(shared: &SharedState, delegate: &JobDelegate) {
    let mut state = MarkingState::new(Arc::clone(&shared.worklists));
    let mut consecutive_empty = 0;
    let mut sleep_us = MIN_SLEEP_US;
    let mut processed = 0;

    while !delegate.should_yield() {
        // Count before popping so `is_idle` never misses an item in transit
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let item = shared.worklists.pop_marking();
        if let Some(item) = item {
            let payload = item.desc.base_object_payload;
            // SAFETY: marking items always describe heap objects.
            let header = unsafe { HeapObjectHeader::from_payload(payload) };
            state.account_marked_bytes(header.allocated_size());
            let mut visitor = MarkingVisitor::concurrent(&mut state);
            (item.desc.callback)(&mut visitor, payload);
            processed += 1;
        }
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);

        if item.is_some() {
            consecutive_empty = 0;
            sleep_us = MIN_SLEEP_US;
            continue;
        }

        consecutive_empty += 1;
        if consecutive_empty < SPIN_ITERATIONS {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(Duration::from_micros(sleep_us));
            sleep_us = (sleep_us * 2).min(MAX_SLEEP_US);
        }
    }

    shared
        .marked_bytes
        .fetch_add(state.marked_bytes(), Ordering::AcqRel);
    shared.processed.fetch_add(processed, Ordering::Relaxed);
    log::trace!(
        "Marker worker {} exiting after {} objects",
        delegate.worker_id(),
        processed
    );
}
