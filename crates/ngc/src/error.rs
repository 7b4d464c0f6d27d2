//! Error Module - NGC Error Types
//!
//! Defines all error types used in NGC.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `OutOfMemory` - Page backend could not provide memory
//! - `VirtualMemoryError` - Mapping or unmapping page memory failed
//! - `ObjectTooLarge` - Request exceeds the largest encodable object
//!
//! ## Contract Errors
//! - `InvalidArgument` - Invalid function argument
//! - `InvalidState` - Operation not allowed in the current heap phase
//! - `UnknownCustomSpace` - Type names a custom space the heap does not have
//!
//! ## Configuration Errors
//! - `Configuration` - Invalid heap configuration
//!
//! Conditions that indicate heap corruption are not errors at all: they go
//! through [`fatal!`](crate::fatal) and abort the process.

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all NGC operations
///
/// # Examples
///
/// ```rust
/// use ngc::error::NgcError;
///
/// fn handle_error(err: NgcError) {
///     match err {
///         NgcError::OutOfMemory { requested, .. } => {
///             eprintln!("OOM: requested {}", requested);
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum NgcError {
    /// Out of memory - page backend exhausted
    ///
    /// **When returned:** A new normal or large page could not be mapped
    ///
    /// **Recovery strategy:** Run a collection and retry, or fail gracefully
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Virtual memory error
    ///
    /// **When returned:** OS virtual memory API call failed
    ///
    /// **Recovery strategy:** Platform-specific recovery or fail
    #[error("Virtual memory error: {0}")]
    VirtualMemoryError(String),

    /// Object too large
    ///
    /// **When returned:** Allocated size would not fit the header's size field
    #[error("Object too large: {size} bytes exceeds maximum of {max} bytes")]
    ObjectTooLarge { size: usize, max: usize },

    /// Unknown custom space
    ///
    /// **When returned:** A type names a custom space index that was not
    /// declared in [`HeapConfig::custom_spaces`](crate::config::HeapConfig)
    ///
    /// **Recovery strategy:** Fix the heap configuration
    #[error("Unknown custom space {index}: heap declares {count} custom spaces")]
    UnknownCustomSpace { index: usize, count: usize },

    /// Invalid state
    ///
    /// **When returned:** Operation is not allowed in the current heap phase
    ///
    /// **Example scenario:** Allocating from inside a finalizer
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid argument
    ///
    /// **When returned:** Function argument fails validation
    ///
    /// **Example scenarios:**
    /// - Address does not belong to the heap
    /// - Alignment not a power of 2
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    ///
    /// **When returned:** Heap configuration failed validation
    ///
    /// **Recovery strategy:** Use default configuration or fail fast
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Internal error - indicates a bug in NGC
    ///
    /// **Action required:** Report to developers with full stack trace
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NgcError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NgcError::OutOfMemory { .. } | NgcError::VirtualMemoryError(_)
        )
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(self, NgcError::InvalidState { .. } | NgcError::Internal(_))
    }

    pub(crate) fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        NgcError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<String> for NgcError {
    fn from(msg: String) -> Self {
        NgcError::Internal(msg)
    }
}

/// Result type alias for NGC operations
pub type Result<T> = std::result::Result<T, NgcError>;

/// Macro for early return with error
#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(format!($fmt, $($arg)*).into())
    };
}

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

/// Log and abort the process
///
/// Used for conditions after which the heap can no longer be trusted:
/// unsupported alignment requests and inconsistent worklists at the end of
/// marking. Unwinding is not an option since objects may be half traced.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("NGC fatal error: {}", format!($($arg)*));
        eprintln!("NGC fatal error: {}", format!($($arg)*));
        std::process::abort()
    }};
}
