//! GC Timer - Timing Utilities
//!
//! Timers for pause accounting and deadlines for incremental steps.

use std::time::{Duration, Instant};

/// GcTimer - timer for measuring GC operations
pub struct GcTimer {
    start: Instant,
}

impl GcTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for GcTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Point in time an incremental step must stop at
///
/// `None` budget means no deadline (atomic pause).
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
        }
    }

    pub fn never() -> Self {
        Self { at: None }
    }

    #[inline]
    pub fn is_reached(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}
