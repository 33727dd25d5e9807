use crate::time::Duration;

/// A ping is due once a full keep-alive interval has passed without contact.
///
/// A zero interval disables keep-alive.
#[must_use]
pub fn is_keepalive_due(since_last_contact: Duration, keep_alive: Duration) -> bool {
    !keep_alive.is_zero() && since_last_contact >= keep_alive
}

/// The retry interval actually applied: the configured value, raised to the floor.
#[must_use]
pub fn effective_retry_interval(retry_interval: Duration, floor: Duration) -> Duration {
    retry_interval.max(floor)
}

/// A resend is due once an entry has gone untouched for longer than the
/// effective retry interval. A zero retry interval disables retries.
#[must_use]
pub fn is_retry_due(since_last_touch: Duration, retry_interval: Duration, floor: Duration) -> bool {
    !retry_interval.is_zero() && since_last_touch > effective_retry_interval(retry_interval, floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_MIN_RETRY_INTERVAL;

    #[test]
    fn test_keepalive_due_at_interval() {
        let keep_alive = Duration::from_secs(30);
        assert!(!is_keepalive_due(Duration::from_secs(20), keep_alive));
        assert!(is_keepalive_due(Duration::from_secs(30), keep_alive));
        assert!(is_keepalive_due(Duration::from_secs(31), keep_alive));
    }

    #[test]
    fn test_keepalive_disabled() {
        assert!(!is_keepalive_due(Duration::from_secs(1_000), Duration::ZERO));
    }

    #[test]
    fn test_retry_floor_applies() {
        let floor = DEFAULT_MIN_RETRY_INTERVAL;
        assert_eq!(
            effective_retry_interval(Duration::from_secs(5), floor),
            Duration::from_secs(10)
        );
        assert!(!is_retry_due(Duration::from_secs(6), Duration::from_secs(5), floor));
        assert!(is_retry_due(Duration::from_secs(11), Duration::from_secs(5), floor));
    }

    #[test]
    fn test_retry_is_strictly_greater() {
        let interval = Duration::from_secs(20);
        assert!(!is_retry_due(interval, interval, Duration::from_secs(10)));
        assert!(is_retry_due(
            interval + Duration::from_millis(1),
            interval,
            Duration::from_secs(10)
        ));
    }

    #[test]
    fn test_retry_disabled() {
        assert!(!is_retry_due(
            Duration::from_secs(1_000),
            Duration::ZERO,
            Duration::ZERO
        ));
    }
}
