use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Total attempts per request, including the first one.
pub const MAX_ATTEMPTS: u32 = 3;
/// Delay before the first retry; doubles for each further retry.
pub const BASE_DELAY: Duration = Duration::from_millis(1000);

fn transient_text_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|overloaded|service.?unavailable|upstream.?connect|connection.?(refused|reset)|timed?.?out")
            .expect("transient error regex must compile")
    })
}

/// Error text describing a transient condition (overload, throttling, reset).
pub fn is_transient_error_text(text: &str) -> bool {
    transient_text_regex().is_match(text)
}

/// Retry statuses: throttling and server-side failures. Other 4xx are final.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// First backoff delay; later attempts double it.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Total attempts including the first request.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(2u32.saturating_pow(exponent))
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_one_then_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert!(policy.has_attempts_left(2));
        assert!(!policy.has_attempts_left(3));
    }

    #[test]
    fn only_throttling_and_server_errors_retry() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn transient_text_detection() {
        assert!(is_transient_error_text("Service Unavailable"));
        assert!(is_transient_error_text("server_overloaded"));
        assert!(!is_transient_error_text("invalid tool schema"));
    }
}
