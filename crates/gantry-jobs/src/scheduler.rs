//! Per-pipeline job scheduler.
//!
//! A [`JobScheduler`] owns the pending queue and the active set of one
//! pipeline. Every state transition (submit, dequeue, completion, retry,
//! cancellation) happens under a single lock, so two tasks can never dequeue
//! the same job or double-count an active slot. The scheduling check runs
//! after every transition; nothing polls.
//!
//! Lifecycle events are appended to an outbox inside the same critical
//! section that performs the transition and are delivered to the
//! [`EventBus`] afterwards, so per-job ordering matches transition order
//! while listeners never run under the scheduler lock.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use gantry_core::{
    defaults, validate_identifier, Error, EventBus, Job, JobEvent, JobFailure, JobOptions,
    JobStatus, QueueStats, Result,
};
use gantry_db::PersistenceStore;

use crate::classifier::{ClassifierConfig, ErrorClassifier};
use crate::handler::{CancelHandle, JobContext, JobHandler};
use crate::job_error::JobError;

/// Configuration for one pipeline's scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once.
    pub max_concurrent: usize,
    /// Default retry ceiling for submitted jobs.
    pub max_retries: u32,
    /// Per-invocation handler timeout. `None` disables it.
    pub job_timeout: Option<Duration>,
    /// Retry backoff parameters.
    pub classifier: ClassifierConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::JOB_MAX_CONCURRENT,
            max_retries: defaults::JOB_MAX_RETRIES,
            job_timeout: Some(Duration::from_secs(defaults::JOB_TIMEOUT_SECS)),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GANTRY_MAX_CONCURRENT` | `4` | Max concurrent jobs per pipeline |
    /// | `GANTRY_MAX_RETRIES` | `3` | Default retry ceiling |
    /// | `GANTRY_JOB_TIMEOUT_SECS` | `300` | Handler timeout, `0` disables |
    ///
    /// Backoff variables are documented on [`ClassifierConfig::from_env`].
    pub fn from_env() -> Self {
        let max_concurrent = std::env::var("GANTRY_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let max_retries = std::env::var("GANTRY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::JOB_MAX_RETRIES);

        let timeout_secs = std::env::var("GANTRY_JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_TIMEOUT_SECS);

        Self {
            max_concurrent,
            max_retries,
            job_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            classifier: ClassifierConfig::from_env(),
        }
    }

    /// Set maximum concurrent jobs (at least 1).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the handler timeout; `None` disables it.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }
}

/// How one handler invocation ended.
enum Outcome {
    Succeeded(Option<JsonValue>),
    Failed(JobError),
    Panicked(String),
}

struct SchedulerState {
    jobs: HashMap<String, Job>,
    /// Job ids in creation order.
    order: Vec<String>,
    /// Queued and paused jobs in dequeue order.
    pending: VecDeque<String>,
    active: HashMap<String, CancelHandle>,
    /// Jobs sleeping through a retry backoff.
    delayed: HashMap<String, JoinHandle<()>>,
    outbox: VecDeque<JobEvent>,
    paused: bool,
    accepting: bool,
}

struct SchedulerInner {
    pipeline_id: String,
    config: SchedulerConfig,
    classifier: ErrorClassifier,
    handler: Arc<dyn JobHandler>,
    store: PersistenceStore,
    events: EventBus,
    state: Mutex<SchedulerState>,
    /// Held while delivering the outbox, so events leave in order.
    delivery: Mutex<()>,
    idle: Notify,
}

/// Bounded-concurrency job queue for a single pipeline.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    /// Create a scheduler and resume whatever the store holds for the pipeline.
    ///
    /// Terminal records are kept as history. `queued` and `paused` records
    /// go back into the pending queue in creation order; `running` records
    /// (interrupted by a restart) are re-queued. Retry counts are preserved.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        pipeline_id: impl Into<String>,
        config: SchedulerConfig,
        handler: Arc<dyn JobHandler>,
        store: PersistenceStore,
        events: EventBus,
    ) -> Self {
        let pipeline_id = pipeline_id.into();
        let mut state = SchedulerState {
            jobs: HashMap::new(),
            order: Vec::new(),
            pending: VecDeque::new(),
            active: HashMap::new(),
            delayed: HashMap::new(),
            outbox: VecDeque::new(),
            paused: false,
            accepting: true,
        };

        let mut resumed = 0usize;
        for mut job in store.load_pipeline(&pipeline_id) {
            match job.status {
                JobStatus::Running => {
                    warn!(
                        pipeline_id = %pipeline_id,
                        job_id = %job.id,
                        retry_count = job.retry_count,
                        "Re-queueing job interrupted by restart"
                    );
                    job.status = JobStatus::Queued;
                    store.upsert(&job);
                    state.pending.push_back(job.id.clone());
                    resumed += 1;
                }
                JobStatus::Queued | JobStatus::Paused => {
                    state.pending.push_back(job.id.clone());
                    resumed += 1;
                }
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {}
            }
            state.order.push(job.id.clone());
            state.jobs.insert(job.id.clone(), job);
        }

        info!(
            pipeline_id = %pipeline_id,
            max_concurrent = config.max_concurrent,
            max_retries = config.max_retries,
            record_count = state.jobs.len(),
            resumed,
            "Job scheduler started"
        );

        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                classifier: ErrorClassifier::new(config.classifier.clone()),
                pipeline_id,
                config,
                handler,
                store,
                events,
                state: Mutex::new(state),
                delivery: Mutex::new(()),
                idle: Notify::new(),
            }),
        };
        scheduler.pump();
        scheduler
    }

    pub fn pipeline_id(&self) -> &str {
        &self.inner.pipeline_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same scheduler instance.
    pub fn ptr_eq(&self, other: &JobScheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue a job. Never suspends.
    ///
    /// Fails with `InvalidInput` for a malformed caller-supplied id,
    /// `DuplicateJob` if the id was ever used in this pipeline, and
    /// `ShuttingDown` once [`shutdown`](Self::shutdown) started.
    pub fn submit(&self, payload: JsonValue, options: JobOptions) -> Result<Job> {
        let job = {
            let mut state = self.state();
            if !state.accepting {
                return Err(Error::ShuttingDown(format!(
                    "pipeline {} no longer accepts jobs",
                    self.inner.pipeline_id
                )));
            }

            let id = match options.id {
                Some(id) => {
                    validate_identifier("job id", &id)?;
                    id
                }
                None => Uuid::now_v7().to_string(),
            };
            if state.jobs.contains_key(&id) {
                return Err(Error::DuplicateJob {
                    pipeline_id: self.inner.pipeline_id.clone(),
                    job_id: id,
                });
            }

            let job = Job::new(
                self.inner.pipeline_id.clone(),
                id,
                payload,
                options.max_retries.unwrap_or(self.inner.config.max_retries),
            );
            self.inner.store.upsert(&job);
            state.order.push(job.id.clone());
            state.pending.push_back(job.id.clone());
            state.jobs.insert(job.id.clone(), job.clone());
            state.outbox.push_back(JobEvent::JobCreated {
                pipeline_id: job.pipeline_id.clone(),
                job_id: job.id.clone(),
            });
            job
        };

        debug!(
            pipeline_id = %job.pipeline_id,
            job_id = %job.id,
            max_retries = job.max_retries,
            "Job queued"
        );
        self.pump();
        Ok(job)
    }

    /// Cancel a job.
    ///
    /// Queued (including backoff-delayed) and paused jobs are cancelled
    /// immediately. For a running job only the cancellation flag is set; the
    /// handler observes it through [`JobContext::is_cancelled`]. Returns
    /// `false` for jobs already in a terminal state.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let accepted = {
            let mut state = self.state();
            let status = state
                .jobs
                .get(job_id)
                .map(|job| job.status)
                .ok_or_else(|| self.not_found(job_id))?;

            match status {
                JobStatus::Queued | JobStatus::Paused => {
                    state.pending.retain(|id| id != job_id);
                    if let Some(timer) = state.delayed.remove(job_id) {
                        timer.abort();
                    }
                    if let Some(job) = state.jobs.get_mut(job_id) {
                        job.status = JobStatus::Cancelled;
                        job.completed_at = Some(Utc::now());
                        self.inner.store.upsert(job);
                    }
                    state.outbox.push_back(JobEvent::JobCancelled {
                        pipeline_id: self.inner.pipeline_id.clone(),
                        job_id: job_id.to_string(),
                    });
                    info!(pipeline_id = %self.inner.pipeline_id, job_id, "Queued job cancelled");
                    true
                }
                JobStatus::Running => {
                    if let Some(handle) = state.active.get(job_id) {
                        handle.cancel();
                    }
                    info!(
                        pipeline_id = %self.inner.pipeline_id,
                        job_id,
                        "Cancellation requested for running job"
                    );
                    true
                }
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
            }
        };
        self.pump();
        Ok(accepted)
    }

    /// Stop dequeuing. Running jobs continue.
    pub fn pause(&self) {
        self.state().paused = true;
        info!(pipeline_id = %self.inner.pipeline_id, "Pipeline paused");
    }

    /// Resume dequeuing after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.state().paused = false;
        info!(pipeline_id = %self.inner.pipeline_id, "Pipeline resumed");
        self.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Hold a queued job. It keeps its queue position but is skipped by
    /// dequeue until resumed. Returns `false` unless the job was `queued`.
    pub fn pause_job(&self, job_id: &str) -> Result<bool> {
        self.set_held(job_id, JobStatus::Queued, JobStatus::Paused)
    }

    /// Release a job held by [`pause_job`](Self::pause_job).
    pub fn resume_job(&self, job_id: &str) -> Result<bool> {
        let resumed = self.set_held(job_id, JobStatus::Paused, JobStatus::Queued)?;
        if resumed {
            self.pump();
        }
        Ok(resumed)
    }

    /// Snapshot of one job.
    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.state().jobs.get(job_id).cloned()
    }

    /// All jobs in creation order, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect()
    }

    /// Queue statistics. No side effects.
    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        let mut stats = QueueStats {
            active: state.active.len(),
            max_concurrent: self.inner.config.max_concurrent,
            ..QueueStats::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Running => {}
            }
        }
        stats
    }

    /// Stop accepting work and wait for running jobs.
    ///
    /// Queued jobs (including those waiting out a retry backoff) stay
    /// `queued` in the store and resume on the next start. If running jobs
    /// outlast `drain_timeout`, cancellation is requested for them and the
    /// scheduler stops waiting.
    #[instrument(skip(self), fields(subsystem = "jobs", pipeline_id = %self.inner.pipeline_id))]
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let timers: Vec<JoinHandle<()>> = {
            let mut state = self.state();
            if !state.accepting {
                return;
            }
            state.accepting = false;
            state.delayed.drain().map(|(_, timer)| timer).collect()
        };
        for timer in timers {
            timer.abort();
        }

        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            let idle = self.inner.idle.notified();
            let active = self.state().active.len();
            if active == 0 {
                break;
            }
            debug!(active, "Waiting for running jobs to finish");
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(
                    active,
                    drain_timeout_ms = drain_timeout.as_millis() as u64,
                    "Drain timed out, requesting cancellation of running jobs"
                );
                self.cancel_running();
                break;
            }
        }

        self.inner.handler.shutdown().await;
        self.deliver_events();
        info!("Job scheduler stopped");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_running(&self) {
        for handle in self.state().active.values() {
            handle.cancel();
        }
    }

    fn not_found(&self, job_id: &str) -> Error {
        Error::JobNotFound {
            pipeline_id: self.inner.pipeline_id.clone(),
            job_id: job_id.to_string(),
        }
    }

    fn set_held(&self, job_id: &str, from: JobStatus, to: JobStatus) -> Result<bool> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| self.not_found(job_id))?;
        if job.status != from {
            return Ok(false);
        }
        job.status = to;
        self.inner.store.upsert(job);
        debug!(pipeline_id = %self.inner.pipeline_id, job_id, status = %to, "Job hold changed");
        Ok(true)
    }

    /// Start queued jobs while capacity allows, then deliver events.
    fn pump(&self) {
        let mut started = Vec::new();
        {
            let mut state = self.state();
            while state.accepting
                && !state.paused
                && state.active.len() < self.inner.config.max_concurrent
            {
                let Some(position) = state.pending.iter().position(|id| {
                    state
                        .jobs
                        .get(id)
                        .is_some_and(|job| job.status == JobStatus::Queued)
                }) else {
                    break;
                };
                let Some(job_id) = state.pending.remove(position) else {
                    break;
                };
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    continue;
                };

                job.status = JobStatus::Running;
                if job.started_at.is_none() {
                    job.started_at = Some(Utc::now());
                }
                self.inner.store.upsert(job);
                let snapshot = job.clone();

                state.outbox.push_back(JobEvent::JobStarted {
                    pipeline_id: snapshot.pipeline_id.clone(),
                    job_id: snapshot.id.clone(),
                    attempt: snapshot.attempt(),
                });

                let cancel = CancelHandle::new();
                let ctx = self.context_for(snapshot, &cancel);
                state.active.insert(job_id, cancel);
                started.push(ctx);
            }
        }

        for ctx in started {
            info!(
                pipeline_id = %self.inner.pipeline_id,
                job_id = %ctx.job.id,
                attempt = ctx.attempt(),
                "Processing job"
            );
            tokio::spawn(self.clone().run(ctx));
        }
        self.deliver_events();
    }

    fn context_for(&self, job: Job, cancel: &CancelHandle) -> JobContext {
        let scheduler = self.clone();
        let job_id = job.id.clone();
        JobContext::new(job)
            .with_cancel(cancel)
            .with_progress_callback(move |percent, message| {
                scheduler.state().outbox.push_back(JobEvent::JobProgress {
                    pipeline_id: scheduler.inner.pipeline_id.clone(),
                    job_id: job_id.clone(),
                    percent,
                    message: message.map(String::from),
                });
                scheduler.deliver_events();
            })
    }

    /// Invoke the handler for one dequeued job.
    async fn run(self, ctx: JobContext) {
        let job_id = ctx.job.id.clone();
        let started = Instant::now();
        let handler = self.inner.handler.clone();
        let invocation = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();

        let result = match self.inner.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        pipeline_id = %self.inner.pipeline_id,
                        job_id = %job_id,
                        timeout_ms = limit.as_millis() as u64,
                        "Job exceeded timeout"
                    );
                    Ok(Err(JobError::timeout(format!(
                        "Job exceeded timeout of {}ms",
                        limit.as_millis()
                    ))))
                }
            },
            None => invocation.await,
        };

        let outcome = match result {
            Ok(Ok(data)) => Outcome::Succeeded(data),
            Ok(Err(e)) => Outcome::Failed(e),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(
                    pipeline_id = %self.inner.pipeline_id,
                    job_id = %job_id,
                    panic = %detail,
                    "Job handler panicked"
                );
                Outcome::Panicked(detail)
            }
        };

        self.finish(&job_id, outcome, started.elapsed());
    }

    /// Apply the result of one invocation and free its slot.
    fn finish(&self, job_id: &str, outcome: Outcome, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;
        {
            let mut state = self.state();
            let Some(cancel) = state.active.remove(job_id) else {
                error!(pipeline_id = %self.inner.pipeline_id, job_id, "Finished job was not active");
                return;
            };
            let accepting = state.accepting;
            let SchedulerState { jobs, outbox, .. } = &mut *state;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            let pipeline_id = job.pipeline_id.clone();
            let mut retry_delay = None;

            match outcome {
                Outcome::Succeeded(result) => {
                    job.status = JobStatus::Completed;
                    job.result = result;
                    job.error = None;
                    job.completed_at = Some(Utc::now());
                    outbox.push_back(JobEvent::JobCompleted {
                        pipeline_id,
                        job_id: job_id.to_string(),
                        duration_ms,
                    });
                    info!(
                        pipeline_id = %job.pipeline_id,
                        job_id,
                        attempt = job.attempt(),
                        duration_ms,
                        "Job completed successfully"
                    );
                }
                Outcome::Failed(_) | Outcome::Panicked(_) if cancel.is_cancelled() => {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    outbox.push_back(JobEvent::JobCancelled {
                        pipeline_id,
                        job_id: job_id.to_string(),
                    });
                    info!(pipeline_id = %job.pipeline_id, job_id, duration_ms, "Running job cancelled");
                }
                Outcome::Panicked(detail) => {
                    let failure = JobFailure {
                        message: format!("handler panicked: {detail}"),
                        reason: "handler panicked".to_string(),
                        code: None,
                        retryable: false,
                    };
                    outbox.push_back(JobEvent::JobFailed {
                        pipeline_id,
                        job_id: job_id.to_string(),
                        error: failure.message.clone(),
                        reason: failure.reason.clone(),
                    });
                    job.status = JobStatus::Failed;
                    job.error = Some(failure);
                    job.completed_at = Some(Utc::now());
                }
                Outcome::Failed(err) => {
                    let classification = self.inner.classifier.classify(&err, job.retry_count);
                    if classification.is_retryable() && job.retry_count < job.max_retries {
                        job.retry_count += 1;
                        job.status = JobStatus::Queued;
                        outbox.push_back(JobEvent::RetryCreated {
                            pipeline_id,
                            job_id: job_id.to_string(),
                            retry_count: job.retry_count,
                            delay_ms: classification.suggested_delay_ms,
                            reason: classification.reason.clone(),
                        });
                        info!(
                            pipeline_id = %job.pipeline_id,
                            job_id,
                            retry_count = job.retry_count,
                            max_retries = job.max_retries,
                            delay_ms = classification.suggested_delay_ms,
                            reason = %classification.reason,
                            error = %err,
                            "Retryable failure, job re-queued with backoff"
                        );
                        retry_delay = Some(Duration::from_millis(classification.suggested_delay_ms));
                    } else {
                        let reason = if classification.is_retryable() {
                            outbox.push_back(JobEvent::RetryMaxAttempts {
                                pipeline_id: pipeline_id.clone(),
                                job_id: job_id.to_string(),
                                attempts: job.attempt(),
                            });
                            format!(
                                "retries exhausted after {} attempts ({})",
                                job.attempt(),
                                classification.reason
                            )
                        } else {
                            classification.reason.clone()
                        };
                        warn!(
                            pipeline_id = %job.pipeline_id,
                            job_id,
                            attempt = job.attempt(),
                            reason = %reason,
                            error = %err,
                            duration_ms,
                            "Job failed"
                        );
                        outbox.push_back(JobEvent::JobFailed {
                            pipeline_id,
                            job_id: job_id.to_string(),
                            error: err.to_string(),
                            reason: reason.clone(),
                        });
                        job.status = JobStatus::Failed;
                        job.error = Some(JobFailure {
                            message: err.message().to_string(),
                            reason,
                            code: err.code().map(|c| c.as_str().to_string()),
                            retryable: classification.is_retryable(),
                        });
                        job.completed_at = Some(Utc::now());
                    }
                }
            }

            self.inner.store.upsert(job);

            // Retries scheduled during shutdown stay queued for the next start.
            if let Some(delay) = retry_delay.filter(|_| accepting) {
                let scheduler = self.clone();
                let id = job_id.to_string();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    scheduler.requeue(&id);
                });
                state.delayed.insert(job_id.to_string(), timer);
            }

            if state.active.is_empty() {
                self.inner.idle.notify_waiters();
            }
        }
        self.pump();
    }

    /// Backoff elapsed: put the job at the back of the queue.
    fn requeue(&self, job_id: &str) {
        {
            let mut state = self.state();
            if state.delayed.remove(job_id).is_none() {
                return;
            }
            let still_waiting = state
                .jobs
                .get(job_id)
                .is_some_and(|job| matches!(job.status, JobStatus::Queued | JobStatus::Paused));
            if still_waiting {
                state.pending.push_back(job_id.to_string());
            }
        }
        debug!(pipeline_id = %self.inner.pipeline_id, job_id, "Retry backoff elapsed");
        self.pump();
    }

    /// Deliver outbox events in order. Re-entrant calls (a listener that
    /// submits work) leave their events for the delivering call to pick up.
    fn deliver_events(&self) {
        loop {
            let guard = match self.inner.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let next = self.state().outbox.pop_front();
                match next {
                    Some(event) => self.inner.events.emit(event),
                    None => break,
                }
            }
            drop(guard);
            if self.state().outbox.is_empty() {
                return;
            }
        }
    }
}
