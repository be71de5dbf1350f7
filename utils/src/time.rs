//! Helpers for simulated time.

use std::time::{Duration, SystemTime};

/// Number of nanoseconds in a second.
pub const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Extension trait for [`Duration`].
pub trait DurationExt {
    /// Creates a [`Duration`] from nanoseconds, saturating at [`Duration::MAX`].
    fn from_nanos_saturating(nanos: u128) -> Duration;
}

impl DurationExt for Duration {
    fn from_nanos_saturating(nanos: u128) -> Duration {
        let secs = nanos / NANOS_PER_SEC;
        if secs > u64::MAX as u128 {
            return Duration::MAX;
        }
        let subsec = (nanos % NANOS_PER_SEC) as u32;
        Duration::new(secs as u64, subsec)
    }
}

/// Extension trait for [`SystemTime`].
pub trait SystemTimeExt {
    /// Returns the time elapsed since `earlier`, or zero if `earlier` is in the future.
    fn saturating_since(&self, earlier: SystemTime) -> Duration;
}

impl SystemTimeExt for SystemTime {
    fn saturating_since(&self, earlier: SystemTime) -> Duration {
        self.duration_since(earlier).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_nanos_saturating() {
        assert_eq!(
            Duration::from_nanos_saturating(1_500_000_000),
            Duration::from_millis(1_500)
        );
        assert_eq!(Duration::from_nanos_saturating(u128::MAX), Duration::MAX);
    }

    #[test]
    fn test_saturating_since() {
        let start = SystemTime::UNIX_EPOCH;
        let later = start + Duration::from_secs(3);
        assert_eq!(later.saturating_since(start), Duration::from_secs(3));
        assert_eq!(start.saturating_since(later), Duration::ZERO);
    }
}
