//! Retryable vs. terminal classification of handler failures.
//!
//! Decision order:
//! 1. permanent error codes (missing paths, permissions, DNS, refused connections)
//! 2. transient error codes (timeouts, resets, `EAGAIN`)
//! 3. HTTP-like status (429 and 5xx retry, other 4xx do not)
//! 4. a small allow-list of transient message phrases
//!
//! Anything unrecognized is `non_retryable`.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::RegexSet;

use gantry_core::{defaults, ClassificationResult};

use crate::job_error::{ErrorCode, JobError};

static TRANSIENT_MESSAGE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\btimed?\s?out\b",
        r"(?i)\btimeout\b",
        r"(?i)connection (was )?reset",
        r"(?i)socket hang up",
        r"(?i)temporar(il)?y unavailable",
        r"(?i)\btry again\b",
        r"(?i)too many requests",
        r"(?i)rate limit",
        r"(?i)service unavailable",
        r"(?i)\bbusy\b",
    ])
    .expect("transient message patterns are valid")
});

/// Backoff parameters for retryable failures.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Delay before the first retry; doubles per retry.
    pub base_delay: Duration,
    /// Ceiling on a single retry delay.
    pub max_delay: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
        }
    }
}

impl ClassifierConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GANTRY_RETRY_BASE_DELAY_MS` | `1000` | First retry delay |
    /// | `GANTRY_RETRY_MAX_DELAY_MS` | `300000` | Retry delay ceiling |
    pub fn from_env() -> Self {
        let base = Self::default();
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        Self {
            base_delay: read("GANTRY_RETRY_BASE_DELAY_MS").unwrap_or(base.base_delay),
            max_delay: read("GANTRY_RETRY_MAX_DELAY_MS").unwrap_or(base.max_delay),
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// Pure, deterministic failure classifier.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a failure of a job that has already been retried `retry_count` times.
    pub fn classify(&self, error: &JobError, retry_count: u32) -> ClassificationResult {
        if let Some(code) = error.code() {
            if is_permanent(code) {
                return ClassificationResult::non_retryable(format!(
                    "permanent error {}: {}",
                    code,
                    describe(code)
                ));
            }
            if is_transient(code) {
                return ClassificationResult::retryable(
                    format!("transient error {}: {}", code, describe(code)),
                    self.backoff_ms(retry_count),
                );
            }
        }

        if let Some(status) = error.status() {
            if status == 429 {
                return ClassificationResult::retryable(
                    "HTTP 429: rate limited",
                    self.backoff_ms(retry_count),
                );
            }
            if (500..600).contains(&status) {
                return ClassificationResult::retryable(
                    format!("HTTP {status}: server error"),
                    self.backoff_ms(retry_count),
                );
            }
            if (400..500).contains(&status) {
                return ClassificationResult::non_retryable(format!(
                    "HTTP {status}: client error"
                ));
            }
        }

        if TRANSIENT_MESSAGE_PATTERNS.is_match(error.message()) {
            return ClassificationResult::retryable(
                "message matches a known transient failure",
                self.backoff_ms(retry_count),
            );
        }

        ClassificationResult::non_retryable("unrecognized error, not retried")
    }

    /// `base * 2^retry_count`, capped at the configured maximum.
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let base = self.config.base_delay.as_millis() as u64;
        let max = self.config.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        base.saturating_mul(factor).min(max)
    }
}

fn is_permanent(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::NotFound
            | ErrorCode::NotADirectory
            | ErrorCode::PermissionDenied
            | ErrorCode::InvalidArgument
            | ErrorCode::AlreadyExists
            | ErrorCode::DnsFailure
            | ErrorCode::ConnectionRefused
    )
}

fn is_transient(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::TimedOut | ErrorCode::ConnectionReset | ErrorCode::TemporarilyUnavailable
    )
}

fn describe(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::NotFound => "file or directory not found",
        ErrorCode::NotADirectory => "path is not a directory",
        ErrorCode::PermissionDenied => "permission denied",
        ErrorCode::InvalidArgument => "invalid argument",
        ErrorCode::AlreadyExists => "already exists",
        ErrorCode::DnsFailure => "host name could not be resolved",
        ErrorCode::ConnectionRefused => "connection refused",
        ErrorCode::TimedOut => "operation timed out",
        ErrorCode::ConnectionReset => "connection reset",
        ErrorCode::TemporarilyUnavailable => "resource temporarily unavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::default()
    }

    #[test]
    fn test_permanent_codes_are_not_retried() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::NotADirectory,
            ErrorCode::PermissionDenied,
            ErrorCode::InvalidArgument,
            ErrorCode::AlreadyExists,
            ErrorCode::DnsFailure,
            ErrorCode::ConnectionRefused,
        ] {
            let result = classifier().classify(&JobError::new("boom").with_code(code), 0);
            assert!(!result.is_retryable(), "{code} should be permanent");
            assert_eq!(result.suggested_delay_ms, 0);
        }
    }

    #[test]
    fn test_permanent_code_wins_over_transient_message() {
        let err = JobError::new("request timed out").with_code(ErrorCode::NotFound);
        assert!(!classifier().classify(&err, 0).is_retryable());
    }

    #[test]
    fn test_transient_codes_back_off_exponentially() {
        let err = JobError::timeout("slow");
        let c = classifier();
        assert_eq!(c.classify(&err, 0).suggested_delay_ms, 1_000);
        assert_eq!(c.classify(&err, 1).suggested_delay_ms, 2_000);
        assert_eq!(c.classify(&err, 3).suggested_delay_ms, 8_000);
        assert!(c.classify(&err, 0).reason.contains("ETIMEDOUT"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let c = classifier();
        assert_eq!(c.backoff_ms(20), 300_000);
        assert_eq!(c.backoff_ms(200), 300_000);
    }

    #[test]
    fn test_http_status_classification() {
        let c = classifier();
        assert!(c.classify(&JobError::http(429, "x"), 0).is_retryable());
        assert!(c.classify(&JobError::http(500, "x"), 0).is_retryable());
        assert!(c.classify(&JobError::http(503, "x"), 0).is_retryable());
        assert!(!c.classify(&JobError::http(404, "x"), 0).is_retryable());
        assert!(!c.classify(&JobError::http(401, "x"), 0).is_retryable());
    }

    #[test]
    fn test_message_patterns() {
        let c = classifier();
        assert!(c.classify(&JobError::new("socket hang up"), 0).is_retryable());
        assert!(c.classify(&JobError::new("Operation TIMED OUT"), 0).is_retryable());
        assert!(c.classify(&JobError::new("resource busy, try again"), 0).is_retryable());
        assert!(!c.classify(&JobError::new("syntax error in config"), 0).is_retryable());
    }

    #[test]
    fn test_unknown_errors_fail_closed() {
        let result = classifier().classify(&JobError::new("something odd"), 0);
        assert!(!result.is_retryable());
        assert!(result.reason.contains("not retried"));
    }

    #[test]
    fn test_custom_base_delay() {
        let c = ErrorClassifier::new(
            ClassifierConfig::default()
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(25)),
        );
        assert_eq!(c.backoff_ms(0), 10);
        assert_eq!(c.backoff_ms(1), 20);
        assert_eq!(c.backoff_ms(2), 25);
    }
}
