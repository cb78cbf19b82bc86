//! Job handlers: the per-pipeline unit of work.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::watch;

use gantry_core::{Job, Result};

use crate::job_error::JobError;

/// Progress callback type for job handlers.
pub type ProgressCallback = Arc<dyn Fn(u8, Option<&str>) + Send + Sync>;

/// Result of job execution: optional result data, or the failure to classify.
pub type JobResult = std::result::Result<Option<JsonValue>, JobError>;

/// Scheduler-side half of a job's cancellation signal.
#[derive(Debug)]
pub(crate) struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn token(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Context provided to job handlers.
pub struct JobContext {
    /// Snapshot of the job at dequeue time.
    pub job: Job,
    cancel_rx: watch::Receiver<bool>,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    /// Create a context that is never cancelled.
    pub fn new(job: Job) -> Self {
        let (_, cancel_rx) = watch::channel(false);
        Self {
            job,
            cancel_rx,
            progress_callback: None,
        }
    }

    pub(crate) fn with_cancel(mut self, handle: &CancelHandle) -> Self {
        self.cancel_rx = handle.token();
        self
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u8, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Report progress (clamped to 100).
    pub fn report_progress(&self, percent: u8, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent.min(100), message);
        }
    }

    /// Whether cancellation of this job has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation is requested. Suitable for `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Scheduler dropped the signal without cancelling.
            std::future::pending::<()>().await;
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.job.attempt()
    }

    /// Get the job payload.
    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }
}

/// Trait for job handlers.
///
/// One handler instance serves every job of its pipeline, possibly
/// concurrently.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// One-time setup, run while the pipeline worker is being constructed.
    /// An error counts as a construction failure.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the owning scheduler shuts down.
    async fn shutdown(&self) {}
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn execute(&self, ctx: JobContext) -> JobResult {
        (self.func)(ctx).await
    }
}

/// No-op handler for testing.
#[derive(Debug, Default)]
pub struct NoOpHandler;

impl NoOpHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        ctx.report_progress(50, Some("Processing..."));
        ctx.report_progress(100, Some("Done"));
        Ok(None)
    }
}
