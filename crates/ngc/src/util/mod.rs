//! Util Module - Shared Utilities
//!
//! Utilities and helper functions used throughout NGC.

pub mod alignment;
pub mod debug;

pub use alignment::Alignment;

/// Raw address inside the heap
pub type Address = usize;
