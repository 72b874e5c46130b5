//! Unix-millisecond timestamps used for every expiry in the workspace

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds in a `Duration`, clamped to `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    millis(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    )
}

/// `now + ttl`, saturating at `u64::MAX` instead of wrapping.
pub fn deadline(now_millis: u64, ttl: Duration) -> u64 {
    now_millis.saturating_add(millis(ttl))
}
