//! Retry policy for provider HTTP calls.

use std::time::Duration;

/// Base delay for the first retry.
const BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on any single backoff.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Whether an HTTP status is worth retrying.
///
/// 429 and transient 5xx responses are; everything else is a caller or
/// provider error that a retry will not fix.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 529)
}

/// Exponential backoff for the given zero-based attempt: 0.5s, 1s, 2s, ...
/// capped at 30s.
pub fn retry_backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [200, 400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(retry_backoff_delay(0), Duration::from_millis(500));
        assert_eq!(retry_backoff_delay(1), Duration::from_secs(1));
        assert_eq!(retry_backoff_delay(2), Duration::from_secs(2));
        assert_eq!(retry_backoff_delay(10), MAX_DELAY);
        assert_eq!(retry_backoff_delay(u32::MAX), MAX_DELAY);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
