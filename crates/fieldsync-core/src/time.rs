//! Wall-clock helper.
//!
//! `web-time` so the same code compiles for a future browser build.
//! Wall time feeds note timestamps, presence liveness, and backoff
//! scheduling - never conflict resolution (that is the Lamport clock's
//! job).

use web_time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
