//! Time helpers.

use time::OffsetDateTime;

/// Current UTC time, truncated to whole milliseconds.
///
/// Persisted timestamps round-trip through backends with millisecond
/// precision, so the core never produces finer-grained values.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - time::Duration::nanoseconds(i64::from(now.nanosecond() % 1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_utc_millisecond_precision() {
        let now = now_utc();
        assert_eq!(now.nanosecond() % 1_000_000, 0);
    }

    #[test]
    fn test_now_utc_monotonic_enough() {
        let a = now_utc();
        let b = now_utc();
        assert!(b >= a);
    }
}
