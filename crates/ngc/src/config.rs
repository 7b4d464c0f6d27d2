//! Configuration Module - Heap Tuning Parameters
//!
//! Two kinds of configuration live here:
//!
//! - [`HeapConfig`]: long-lived heap options, fixed when the heap is created.
//! - [`GcConfig`]: an immutable description of one collection request.
//!   Created fresh per request and never mutated.

use std::time::Duration;

/// 1 Kilobyte
pub const KB: usize = 1024;
/// 1 Megabyte
pub const MB: usize = 1024 * 1024;

/// Collection scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionType {
    /// Collect the whole heap
    Major,
    /// Young-generation collection. The heap is not generational, so minor
    /// requests are served as major collections.
    Minor,
}

/// Whether the native stack may hold references into the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackState {
    /// The stack must be scanned conservatively
    MayContainHeapPointers,
    /// The stack is known to hold no heap references
    NoHeapPointers,
}

/// How marking is performed
///
/// Variants are ordered by capability so that a heap's marking support can
/// cap a request with `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkingType {
    /// Stop-the-world marking to completion
    Atomic,
    /// Marking interleaved with the mutator in bounded steps
    Incremental,
    /// Incremental marking plus background marking threads
    IncrementalAndConcurrent,
}

/// How sweeping is performed
///
/// Ordered by capability, like [`MarkingType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SweepingType {
    /// Clear mark bits without reclaiming anything
    None,
    /// Sweep every page before the collection returns
    Atomic,
    /// Sweep lazily from the allocation slow path and foreground tasks
    Incremental,
    /// Lazy sweeping plus a background sweeping job
    IncrementalAndConcurrent,
}

/// One collection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    pub collection_type: CollectionType,
    pub stack_state: StackState,
    pub marking_type: MarkingType,
    pub sweeping_type: SweepingType,
    /// Requested explicitly by the embedder rather than by heap growing
    pub is_forced: bool,
}

impl GcConfig {
    /// Atomic major collection that scans the stack conservatively
    pub const fn conservative_atomic() -> Self {
        Self {
            collection_type: CollectionType::Major,
            stack_state: StackState::MayContainHeapPointers,
            marking_type: MarkingType::Atomic,
            sweeping_type: SweepingType::Atomic,
            is_forced: false,
        }
    }

    /// Atomic major collection with no heap pointers on the stack
    pub const fn precise_atomic() -> Self {
        Self {
            stack_state: StackState::NoHeapPointers,
            ..Self::conservative_atomic()
        }
    }

    /// Incremental and concurrent marking, stack scanned at the atomic pause
    pub const fn conservative_incremental() -> Self {
        Self {
            marking_type: MarkingType::IncrementalAndConcurrent,
            sweeping_type: SweepingType::IncrementalAndConcurrent,
            ..Self::conservative_atomic()
        }
    }

    /// Incremental and concurrent marking without stack scanning
    pub const fn precise_incremental() -> Self {
        Self {
            stack_state: StackState::NoHeapPointers,
            ..Self::conservative_incremental()
        }
    }

    pub const fn with_stack_state(self, stack_state: StackState) -> Self {
        Self { stack_state, ..self }
    }

    pub const fn with_marking_type(self, marking_type: MarkingType) -> Self {
        Self { marking_type, ..self }
    }

    pub const fn with_sweeping_type(self, sweeping_type: SweepingType) -> Self {
        Self {
            sweeping_type,
            ..self
        }
    }

    pub const fn forced(self) -> Self {
        Self {
            is_forced: true,
            ..self
        }
    }
}

/// Heap growing policy
///
/// The numbers are tuning values, not correctness constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowingPolicy {
    /// Factor applied to live bytes to get the atomic limit
    ///
    /// Default: 1.5
    pub growing_factor: f64,

    /// Lower clamp for the incremental limit, as a fraction of the distance
    /// between live size and the atomic limit
    ///
    /// Default: 0.5
    pub min_incremental_ratio: f64,

    /// Upper clamp for the incremental limit
    ///
    /// Default: 0.9
    pub max_incremental_ratio: f64,

    /// How long incremental marking is expected to take. Bytes allocated at
    /// the current rate during this window are reserved below the atomic
    /// limit.
    ///
    /// Default: 500ms
    pub estimated_marking_time: Duration,
}

impl Default for GrowingPolicy {
    fn default() -> Self {
        Self {
            growing_factor: 1.5,
            min_incremental_ratio: 0.5,
            max_incremental_ratio: 0.9,
            estimated_marking_time: Duration::from_millis(500),
        }
    }
}

/// Declaration of a custom space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSpaceConfig {
    /// Name used in logs and statistics
    pub name: String,
    /// Whether references into this space may be registered as movable
    pub compactable: bool,
}

impl CustomSpaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compactable: false,
        }
    }
}

/// Heap configuration
///
/// # Examples
///
/// ```rust
/// use ngc::config::{HeapConfig, MarkingType};
///
/// let config = HeapConfig {
///     marking_support: MarkingType::Atomic,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Heap size below which growing never schedules a collection earlier
    ///
    /// Default: 0
    pub initial_heap_size: usize,

    /// Limits recomputation policy
    pub growing: GrowingPolicy,

    /// Most capable marking the heap allows
    ///
    /// Default: IncrementalAndConcurrent
    pub marking_support: MarkingType,

    /// Most capable sweeping the heap allows
    ///
    /// Default: IncrementalAndConcurrent
    pub sweeping_support: SweepingType,

    /// Number of background marking threads
    ///
    /// If None, auto-detects based on CPU cores: min(4, num_cpus / 2)
    ///
    /// Default: Auto-detect
    pub concurrent_marking_threads: Option<usize>,

    /// Number of background sweeping threads
    ///
    /// Default: 1
    pub concurrent_sweeping_threads: usize,

    /// Budget of one incremental marking step
    ///
    /// Default: 2ms
    pub incremental_marking_step: Duration,

    /// Budget of one foreground sweeping task
    ///
    /// Default: 5ms
    pub incremental_sweeping_step: Duration,

    /// Budget of sweeping on the allocation slow path
    ///
    /// Default: 1ms
    pub sweep_for_allocation_budget: Duration,

    /// Number of empty normal pages kept mapped for reuse
    ///
    /// Default: 64 (8MB)
    pub page_pool_limit: usize,

    /// Custom spaces, addressed by index
    ///
    /// Default: none
    pub custom_spaces: Vec<CustomSpaceConfig>,

    /// Print GC events to the console
    ///
    /// Default: false
    pub verbose: bool,

    /// Print GC events as JSON
    ///
    /// Default: false
    pub log_json: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_heap_size: 0,
            growing: GrowingPolicy::default(),
            marking_support: MarkingType::IncrementalAndConcurrent,
            sweeping_support: SweepingType::IncrementalAndConcurrent,
            concurrent_marking_threads: None,
            concurrent_sweeping_threads: 1,
            incremental_marking_step: Duration::from_millis(2),
            incremental_sweeping_step: Duration::from_millis(5),
            sweep_for_allocation_budget: Duration::from_millis(1),
            page_pool_limit: 64,
            custom_spaces: Vec::new(),
            verbose: false,
            log_json: false,
        }
    }
}

impl HeapConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let growing = &self.growing;
        if !(growing.growing_factor >= 1.0) {
            return Err(ConfigError::InvalidGrowingPolicy(format!(
                "growing_factor must be >= 1.0, got {}",
                growing.growing_factor
            )));
        }

        if !(0.0..=1.0).contains(&growing.min_incremental_ratio)
            || !(0.0..=1.0).contains(&growing.max_incremental_ratio)
        {
            return Err(ConfigError::InvalidGrowingPolicy(
                "incremental ratios must be within [0.0, 1.0]".to_string(),
            ));
        }

        if growing.min_incremental_ratio > growing.max_incremental_ratio {
            return Err(ConfigError::InvalidGrowingPolicy(
                "min_incremental_ratio cannot exceed max_incremental_ratio".to_string(),
            ));
        }

        if let Some(threads) = self.concurrent_marking_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidThreads(
                    "concurrent_marking_threads must be > 0".to_string(),
                ));
            }
        }

        if self.concurrent_sweeping_threads == 0 {
            return Err(ConfigError::InvalidThreads(
                "concurrent_sweeping_threads must be > 0".to_string(),
            ));
        }

        if self.incremental_marking_step.is_zero() || self.incremental_sweeping_step.is_zero() {
            return Err(ConfigError::InvalidStep(
                "incremental step budgets must be > 0".to_string(),
            ));
        }

        if self.custom_spaces.len() > usize::from(u8::MAX) {
            return Err(ConfigError::TooManyCustomSpaces(self.custom_spaces.len()));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - NGC_INITIAL_HEAP_SIZE
    /// - NGC_MARKING (`atomic`, `incremental`, `concurrent`)
    /// - NGC_SWEEPING (`none`, `atomic`, `incremental`, `concurrent`)
    /// - NGC_MARKING_THREADS
    /// - NGC_SWEEPING_THREADS
    /// - NGC_PAGE_POOL_LIMIT
    /// - NGC_GROWING_FACTOR
    /// - NGC_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export NGC_MARKING=atomic
    /// export NGC_MARKING_THREADS=2
    /// export NGC_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("NGC_INITIAL_HEAP_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.initial_heap_size = size;
            }
        }

        if let Ok(val) = std::env::var("NGC_MARKING") {
            if let Some(marking) = parse_marking_type(&val) {
                config.marking_support = marking;
            }
        }

        if let Ok(val) = std::env::var("NGC_SWEEPING") {
            if let Some(sweeping) = parse_sweeping_type(&val) {
                config.sweeping_support = sweeping;
            }
        }

        if let Ok(val) = std::env::var("NGC_MARKING_THREADS") {
            if let Ok(threads) = val.parse::<usize>() {
                config.concurrent_marking_threads = Some(threads);
            }
        }

        if let Ok(val) = std::env::var("NGC_SWEEPING_THREADS") {
            if let Ok(threads) = val.parse::<usize>() {
                config.concurrent_sweeping_threads = threads;
            }
        }

        if let Ok(val) = std::env::var("NGC_PAGE_POOL_LIMIT") {
            if let Ok(limit) = val.parse::<usize>() {
                config.page_pool_limit = limit;
            }
        }

        if let Ok(val) = std::env::var("NGC_GROWING_FACTOR") {
            if let Ok(factor) = val.parse::<f64>() {
                config.growing.growing_factor = factor;
            }
        }

        if let Ok(val) = std::env::var("NGC_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Resolved number of background marking threads
    pub fn marking_threads(&self) -> usize {
        self.concurrent_marking_threads
            .unwrap_or_else(|| (num_cpus::get() / 2).clamp(1, 4))
    }
}

fn parse_marking_type(value: &str) -> Option<MarkingType> {
    match value.to_ascii_lowercase().as_str() {
        "atomic" => Some(MarkingType::Atomic),
        "incremental" => Some(MarkingType::Incremental),
        "concurrent" | "incremental_and_concurrent" => Some(MarkingType::IncrementalAndConcurrent),
        _ => None,
    }
}

fn parse_sweeping_type(value: &str) -> Option<SweepingType> {
    match value.to_ascii_lowercase().as_str() {
        "none" => Some(SweepingType::None),
        "atomic" => Some(SweepingType::Atomic),
        "incremental" | "lazy" => Some(SweepingType::Incremental),
        "concurrent" | "incremental_and_concurrent" => Some(SweepingType::IncrementalAndConcurrent),
        _ => None,
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid growing policy: {0}")]
    InvalidGrowingPolicy(String),

    #[error("Invalid thread count: {0}")]
    InvalidThreads(String),

    #[error("Invalid step budget: {0}")]
    InvalidStep(String),

    #[error("Too many custom spaces: {0}")]
    TooManyCustomSpaces(usize),
}
