pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Elapsed time between two instants, zero when `later` precedes `earlier`.
#[must_use]
pub fn elapsed_between(later: Instant, earlier: Instant) -> Duration {
    later.saturating_duration_since(earlier)
}

/// Seconds since the Unix epoch, used for persisted timestamps.
#[must_use]
pub fn unix_secs_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
