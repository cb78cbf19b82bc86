//! Core data models for gantry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// Longest accepted pipeline or job identifier.
pub const MAX_IDENTIFIER_LEN: usize = 128;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Status of a job in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure details recorded on a job that ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Error message reported by the handler.
    pub message: String,
    /// Human-readable explanation derived from classification.
    pub reason: String,
    /// Machine-readable error code, when the handler supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Whether the final error was classified as retryable.
    pub retryable: bool,
}

/// A job tracked by a pipeline scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub pipeline_id: String,
    pub status: JobStatus,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a freshly queued job.
    pub fn new(
        pipeline_id: impl Into<String>,
        id: impl Into<String>,
        payload: JsonValue,
        max_retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            pipeline_id: pipeline_id.into(),
            status: JobStatus::Queued,
            payload,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 1-based number of the current (or next) handler invocation.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Caller-supplied job id. Generated (UUIDv7) when absent.
    pub id: Option<String>,
    /// Override of the pipeline's default retry ceiling.
    pub max_retries: Option<u32>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-supplied job id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the retry ceiling for this job.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Queue statistics snapshot for one pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to run, including those sleeping through a retry backoff.
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
    pub max_concurrent: usize,
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Retryable,
    NonRetryable,
}

/// Result of classifying a handler failure. Computed fresh on every failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: ErrorCategory,
    pub reason: String,
    pub suggested_delay_ms: u64,
}

impl ClassificationResult {
    pub fn retryable(reason: impl Into<String>, suggested_delay_ms: u64) -> Self {
        Self {
            category: ErrorCategory::Retryable,
            reason: reason.into(),
            suggested_delay_ms,
        }
    }

    pub fn non_retryable(reason: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::NonRetryable,
            reason: reason.into(),
            suggested_delay_ms: 0,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Retryable
    }
}

// =============================================================================
// HEALTH
// =============================================================================

/// Persistence health reported to monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceHealth {
    pub degraded: bool,
    /// Consecutive flush failures.
    pub failure_count: u32,
    /// Recovery attempts made in the current degraded episode.
    pub recovery_attempts: u32,
    /// Records written while degraded that have not reached durable storage.
    pub queued_write_count: usize,
    /// Bounded recovery gave up; waiting for restart or an explicit trigger.
    pub recovery_exhausted: bool,
}

/// Point-in-time view of a pipeline's construction circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub consecutive_failures: u32,
    pub cooldown_exponent: u32,
    pub open: bool,
    pub probing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Validate a pipeline or job identifier.
///
/// Identifiers end up as file names in durable storage, so only ASCII
/// alphanumerics, `-`, `_` and `.` are accepted, and `.`/`..` are rejected.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::InvalidInput(format!(
            "{kind} exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if value == "." || value == ".." {
        return Err(Error::InvalidInput(format!("{kind} '{value}' is reserved")));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::InvalidInput(format!(
            "{kind} '{value}' contains invalid character {bad:?}"
        )));
    }
    Ok(())
}
