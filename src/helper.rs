//! Helper utilities for Sotproxy
//!
//! This module provides common utility functions used throughout the application.

use std::time::Duration;

/// Default buffer size for IO operations
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default interval between live-stream diagnostics dumps
pub const DEFAULT_DIAGNOSTICS_INTERVAL_SECS: u64 = 15;

const K: f64 = 1024.0;
const M: f64 = 1024.0 * K;
const G: f64 = 1024.0 * M;

/// Format a byte count (or byte rate) with a binary unit suffix
///
/// `1536.0` becomes `"1.50K"`, values below one kibibyte keep a `B` suffix.
pub fn format_bytes(raw: f64) -> String {
    if raw / G > 1.0 {
        format!("{:.2}G", raw / G)
    } else if raw / M > 1.0 {
        format!("{:.2}M", raw / M)
    } else if raw / K > 1.0 {
        format!("{:.2}K", raw / K)
    } else {
        format!("{:.2}B", raw)
    }
}

/// Bytes per second for `bytes` moved over `elapsed`
///
/// A zero duration reports the raw byte count rather than dividing by zero.
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        bytes as f64
    }
}

/// Parse duration from seconds
pub fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
