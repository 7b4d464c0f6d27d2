//! GC Logging and Tracing
//!
//! Every heap owns a [`GcLogger`] that records structured [`GcEvent`]s.
//! Events are kept in memory for inspection and, when the heap is verbose,
//! echoed to the console in human or JSON form.
//!
//! Free-form diagnostics go through the `log` facade instead:
//! - ERROR: fatal conditions right before aborting
//! - WARN: contract violations tolerated in release builds
//! - INFO: cycle start and end
//! - DEBUG: scheduling decisions (deferred or dropped GC requests)
//! - TRACE: per-object and per-page operations

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Log level for GC events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// GC event types
#[derive(Debug, Clone, PartialEq)]
pub enum GcEvent {
    /// Collection requested and started
    CycleStart {
        cycle: u64,
        marking: String,
        reason: String,
    },

    PhaseStart { phase: String, cycle: u64 },

    PhaseEnd {
        phase: String,
        duration_ms: f64,
        cycle: u64,
    },

    /// Atomic pause finished
    CycleEnd {
        cycle: u64,
        duration_ms: f64,
        marked_bytes: usize,
    },

    /// Time the mutator was stopped
    AtomicPause { duration_us: u64 },

    SweepCompleted {
        pages_swept: usize,
        pages_released: usize,
        objects_finalized: usize,
        bytes_reclaimed: usize,
    },

    ExplicitFree { bytes: usize },

    /// Request ignored because a collection may not start right now
    GcRequestDropped { reason: String },

    /// Limits recomputed after marking
    HeapLimitsUpdated {
        live_bytes: usize,
        atomic_limit: usize,
        incremental_limit: usize,
    },
}

impl GcEvent {
    fn level(&self) -> LogLevel {
        match self {
            GcEvent::CycleStart { .. } | GcEvent::CycleEnd { .. } | GcEvent::SweepCompleted { .. } => {
                LogLevel::Info
            },
            GcEvent::PhaseStart { .. }
            | GcEvent::PhaseEnd { .. }
            | GcEvent::AtomicPause { .. }
            | GcEvent::GcRequestDropped { .. }
            | GcEvent::HeapLimitsUpdated { .. } => LogLevel::Debug,
            GcEvent::ExplicitFree { .. } => LogLevel::Trace,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            GcEvent::CycleStart {
                cycle,
                marking,
                reason,
            } => serde_json::json!({
                "type": "cycle_start",
                "cycle": cycle,
                "marking": marking,
                "reason": reason
            }),
            GcEvent::PhaseStart { phase, cycle } => serde_json::json!({
                "type": "phase_start",
                "cycle": cycle,
                "phase": phase
            }),
            GcEvent::PhaseEnd {
                phase,
                duration_ms,
                cycle,
            } => serde_json::json!({
                "type": "phase_end",
                "cycle": cycle,
                "phase": phase,
                "duration_ms": duration_ms
            }),
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                marked_bytes,
            } => serde_json::json!({
                "type": "cycle_end",
                "cycle": cycle,
                "duration_ms": duration_ms,
                "marked_bytes": marked_bytes
            }),
            GcEvent::AtomicPause { duration_us } => serde_json::json!({
                "type": "atomic_pause",
                "duration_us": duration_us
            }),
            GcEvent::SweepCompleted {
                pages_swept,
                pages_released,
                objects_finalized,
                bytes_reclaimed,
            } => serde_json::json!({
                "type": "sweep_completed",
                "pages_swept": pages_swept,
                "pages_released": pages_released,
                "objects_finalized": objects_finalized,
                "bytes_reclaimed": bytes_reclaimed
            }),
            GcEvent::ExplicitFree { bytes } => serde_json::json!({
                "type": "explicit_free",
                "bytes": bytes
            }),
            GcEvent::GcRequestDropped { reason } => serde_json::json!({
                "type": "gc_request_dropped",
                "reason": reason
            }),
            GcEvent::HeapLimitsUpdated {
                live_bytes,
                atomic_limit,
                incremental_limit,
            } => serde_json::json!({
                "type": "heap_limits_updated",
                "live_bytes": live_bytes,
                "atomic_limit": atomic_limit,
                "incremental_limit": incremental_limit
            }),
        }
    }
}

impl std::fmt::Display for GcEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcEvent::CycleStart {
                cycle,
                marking,
                reason,
            } => write!(f, "[GC] Cycle {} started ({} marking, reason: {})", cycle, marking, reason),
            GcEvent::PhaseStart { phase, cycle } => {
                write!(f, "[GC] Cycle {}: {} phase started", cycle, phase)
            },
            GcEvent::PhaseEnd {
                phase,
                duration_ms,
                cycle,
            } => write!(
                f,
                "[GC] Cycle {}: {} phase completed ({:.2}ms)",
                cycle, phase, duration_ms
            ),
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                marked_bytes,
            } => write!(
                f,
                "[GC] Cycle {} completed ({:.2}ms, {} live)",
                cycle,
                duration_ms,
                crate::util::debug::format_bytes(*marked_bytes)
            ),
            GcEvent::AtomicPause { duration_us } => write!(f, "[GC] Atomic pause: {} us", duration_us),
            GcEvent::SweepCompleted {
                pages_swept,
                pages_released,
                objects_finalized,
                bytes_reclaimed,
            } => write!(
                f,
                "[GC] Swept {} pages ({} released), {} finalized, {} reclaimed",
                pages_swept,
                pages_released,
                objects_finalized,
                crate::util::debug::format_bytes(*bytes_reclaimed)
            ),
            GcEvent::ExplicitFree { bytes } => write!(f, "[GC] Explicit free: {} bytes", bytes),
            GcEvent::GcRequestDropped { reason } => write!(f, "[GC] Request dropped: {}", reason),
            GcEvent::HeapLimitsUpdated {
                live_bytes,
                atomic_limit,
                incremental_limit,
            } => write!(
                f,
                "[GC] Limits: live {}, incremental {}, atomic {}",
                crate::util::debug::format_bytes(*live_bytes),
                crate::util::debug::format_bytes(*incremental_limit),
                crate::util::debug::format_bytes(*atomic_limit)
            ),
        }
    }
}

/// GC Logger configuration
#[derive(Debug, Clone)]
pub struct GcLoggerConfig {
    /// Minimum log level recorded
    pub level: LogLevel,

    /// Echo events to stdout
    pub console: bool,

    pub json: bool,

    pub timestamps: bool,

    /// Oldest events are dropped beyond this
    pub capacity: usize,
}

impl Default for GcLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            console: false,
            json: false,
            timestamps: true,
            capacity: 4096,
        }
    }
}

/// Per-heap event log
pub struct GcLogger {
    config: GcLoggerConfig,
    events: Mutex<Vec<(Instant, GcEvent)>>,
    enabled: AtomicBool,
}

impl GcLogger {
    pub fn new(config: GcLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() || event.level() > self.config.level {
            return;
        }

        if self.config.console {
            self.output_console(&event);
        }

        let mut events = self.events.lock();
        if events.len() >= self.config.capacity && !events.is_empty() {
            events.remove(0);
        }
        events.push((Instant::now(), event));
    }

    fn output_console(&self, event: &GcEvent) {
        let prefix = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            if let Ok(json) = serde_json::to_string(&event.to_json()) {
                println!("{}{}", prefix, json);
            }
        } else {
            println!("{}{}", prefix, event);
        }
    }

    pub fn events(&self) -> Vec<(Instant, GcEvent)> {
        self.events.lock().clone()
    }

    /// Events recorded within `window` of now
    pub fn recent_events(&self, window: Duration) -> Vec<GcEvent> {
        let now = Instant::now();
        self.events
            .lock()
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= window)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(GcLoggerConfig::default())
    }
}

impl std::fmt::Debug for GcLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcLogger")
            .field("level", &self.config.level)
            .field("events", &self.event_count())
            .finish()
    }
}
