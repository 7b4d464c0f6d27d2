//! GC Invoker - Gatekeeper for collection requests
//!
//! A conservative collection needs to scan the mutator stack. On platforms
//! that cannot do that, the invoker turns such requests into a foreground
//! task that runs later from the message loop, where the stack holds no heap
//! pointers.
//!
//! Deferral Rules:
//! - `NoHeapPointers` requests, or a platform with stack scan support:
//!   forwarded synchronously
//! - Otherwise: posted once as a non-nestable task that forces
//!   `NoHeapPointers`; further requests are dropped while it is pending
//! - No non-nestable runner: the request is dropped
//!
//! A posted task remembers the collector epoch. If a collection completes
//! before the task runs, the task does nothing.

use crate::config::{GcConfig, MarkingType, StackState};
use crate::gc::GarbageCollector;
use crate::platform::{Platform, TaskHandle, TaskRunner};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSupport {
    SupportsConservativeStackScan,
    NoConservativeStackScan,
}

pub struct GcInvoker {
    collector: Weak<dyn GarbageCollector>,
    platform: Arc<dyn Platform>,
    stack_support: StackSupport,
    pending: Mutex<Option<TaskHandle>>,
}

impl GcInvoker {
    pub fn new(collector: Weak<dyn GarbageCollector>, platform: Arc<dyn Platform>) -> Self {
        let stack_support = if platform.supports_conservative_stack_scan() {
            StackSupport::SupportsConservativeStackScan
        } else {
            StackSupport::NoConservativeStackScan
        };
        Self {
            collector,
            platform,
            stack_support,
            pending: Mutex::new(None),
        }
    }

    pub fn stack_support(&self) -> StackSupport {
        self.stack_support
    }

    /// Whether a deferred collection is posted and has not run yet
    pub fn has_pending_task(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_canceled())
    }

    fn non_nestable_runner(&self) -> Option<Arc<dyn TaskRunner>> {
        self.platform
            .foreground_task_runner()
            .filter(|runner| runner.non_nestable_tasks_enabled())
    }

    fn post_deferred_collection(&self, collector: &dyn GarbageCollector, config: GcConfig) {
        let Some(runner) = self.non_nestable_runner() else {
            log::debug!(
                "Dropping conservative GC request: no stack scan support and no non-nestable task runner"
            );
            return;
        };

        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|handle| !handle.is_canceled()) {
            return;
        }

        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let weak = self.collector.clone();
        let saved_epoch = collector.epoch();
        let task_config = config.with_stack_state(StackState::NoHeapPointers);
        runner.post_non_nestable_task(Box::new(move || {
            if task_handle.is_canceled() {
                return;
            }
            // The handle is finished either way, so later requests can post
            task_handle.cancel();
            let Some(collector) = weak.upgrade() else {
                return;
            };
            if collector.epoch() != saved_epoch {
                log::trace!("Skipping deferred GC: collection already happened");
                return;
            }
            collector.collect_garbage(task_config);
        }));
        log::debug!("Posted deferred GC task at epoch {}", saved_epoch);
        *pending = Some(handle);
    }
}

impl GarbageCollector for GcInvoker {
    fn collect_garbage(&self, config: GcConfig) {
        debug_assert_eq!(config.marking_type, MarkingType::Atomic);
        let Some(collector) = self.collector.upgrade() else {
            return;
        };
        if config.stack_state == StackState::NoHeapPointers
            || self.stack_support == StackSupport::SupportsConservativeStackScan
        {
            collector.collect_garbage(config);
            return;
        }
        self.post_deferred_collection(collector.as_ref(), config);
    }

    fn start_incremental_garbage_collection(&self, config: GcConfig) {
        debug_assert_ne!(config.marking_type, MarkingType::Atomic);
        if self.stack_support == StackSupport::NoConservativeStackScan
            && self.non_nestable_runner().is_none()
        {
            log::debug!("Incremental GC not possible on this platform");
            return;
        }
        if let Some(collector) = self.collector.upgrade() {
            collector.start_incremental_garbage_collection(config);
        }
    }

    fn epoch(&self) -> usize {
        self.collector.upgrade().map_or(0, |c| c.epoch())
    }

    fn override_stack_state(&self) -> Option<StackState> {
        self.collector.upgrade().and_then(|c| c.override_stack_state())
    }

    fn set_override_stack_state(&self, state: StackState) {
        if let Some(collector) = self.collector.upgrade() {
            collector.set_override_stack_state(state);
        }
    }

    fn clear_overridden_stack_state(&self) {
        if let Some(collector) = self.collector.upgrade() {
            collector.clear_overridden_stack_state();
        }
    }
}

impl Drop for GcInvoker {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().take() {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for GcInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcInvoker")
            .field("stack_support", &self.stack_support)
            .field("pending", &self.has_pending_task())
            .finish()
    }
}
