//! Utilities shared by the ehub crates
//!
//! ## Core Features:
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Timestamp Utilities**: Unix timestamps in seconds, as embedded in log keys
//! - **Key Codecs**: Big-endian `u64` encoding used for ordered store keys
//! - **Task Supervision**: [`Tomb`], a kill switch plus join handle for background tasks
//!
//! ## Usage Examples:
//! ```rust
//! use ehub_utils::{to_duration, u64_to_bytes, bytes_to_u64};
//!
//! // Duration conversion
//! let duration = to_duration("1h30m15s");
//! assert_eq!(duration.as_secs(), 5415);
//!
//! // Ordered key encoding
//! let key = u64_to_bytes(42);
//! assert_eq!(bytes_to_u64(&key), 42);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::de::{Deserialize, Deserializer};

mod tomb;

pub use tomb::{Tomb, TombResult};

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Convert human-readable duration string to Duration
///
/// Supported units: ms, s, m, h, d, w. Units may be combined, e.g. "1h30m".
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Current unix timestamp in seconds
#[inline]
pub fn timestamp_secs() -> u64 {
    chrono::Local::now().timestamp().max(0) as u64
}

#[inline]
pub fn u64_to_bytes(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Reads the first 8 bytes as a big-endian `u64`, zero padded when shorter.
#[inline]
pub fn bytes_to_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = b.len().min(8);
    buf[..n].copy_from_slice(&b[..n]);
    u64::from_be_bytes(buf)
}

/// Concatenates two big-endian `u64`s, `a` first.
#[inline]
pub fn u64u64_to_bytes(a: u64, b: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&a.to_be_bytes());
    buf[8..].copy_from_slice(&b.to_be_bytes());
    buf
}
