//! Error types for gantry.

use thiserror::Error;

/// Result type alias using gantry's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for gantry operations.
///
/// Only a handful of these ever reach an external caller: job/pipeline lookups,
/// disabled pipelines and an open circuit breaker. Handler failures are
/// represented separately (see `gantry_jobs::JobError`) and persistence
/// failures are absorbed by degraded mode.
///
/// The enum is `Clone` so that a single failed pipeline construction can be
/// handed to every caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Job id not present in the pipeline.
    #[error("Job not found: {pipeline_id}/{job_id}")]
    JobNotFound { pipeline_id: String, job_id: String },

    /// No construction recipe registered for the pipeline.
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    /// Pipeline administratively disabled.
    #[error("Pipeline disabled: {0}")]
    PipelineDisabled(String),

    /// Circuit breaker is open for the pipeline.
    #[error("Circuit open for pipeline {pipeline_id}: {}", circuit_detail(.retry_after_ms, .probing))]
    CircuitOpen {
        pipeline_id: String,
        retry_after_ms: u64,
        probing: bool,
    },

    /// Pipeline construction exceeded the initialization timeout.
    #[error("Pipeline {pipeline_id} initialization timed out after {timeout_ms}ms")]
    InitTimeout { pipeline_id: String, timeout_ms: u64 },

    /// Pipeline construction failed.
    #[error("Pipeline {pipeline_id} construction failed: {message}")]
    Construction {
        pipeline_id: String,
        message: String,
    },

    /// A job with the same id already exists in the pipeline.
    #[error("Duplicate job id: {pipeline_id}/{job_id}")]
    DuplicateJob { pipeline_id: String, job_id: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Component is shutting down and no longer accepts work.
    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    /// Durable storage operation failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn circuit_detail(retry_after_ms: &u64, probing: &bool) -> String {
    if *probing {
        "recovery probe in progress".to_string()
    } else {
        format!("cooling down, retry in {retry_after_ms}ms")
    }
}

impl Error {
    /// Remaining cooldown carried by a `CircuitOpen` error.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::CircuitOpen { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
