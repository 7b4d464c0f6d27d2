//! Debug Utilities
//!
//! Helper functions for debugging and logging.

/// Debug formatter for memory addresses
pub fn format_address(address: usize) -> String {
    format!("0x{:016X}", address)
}

/// Human readable byte count used in verbose logs
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
