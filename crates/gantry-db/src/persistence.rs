//! Job-record persistence with degraded-mode operation.
//!
//! Every mutation lands in an in-memory map immediately (never blocking the
//! scheduler) and is mirrored to a [`DurableBackend`] by a periodic flush.
//!
//! ## Degraded mode
//!
//! After `failure_threshold` consecutive flush failures the store:
//! 1. stops periodic flushing,
//! 2. raises one alert through the [`ErrorSink`],
//! 3. tracks which records still need to reach disk (the backlog),
//! 4. retries with exponential backoff from a recovery task.
//!
//! A successful recovery flush exits degraded mode and clears the backlog. If
//! the bounded recovery attempts run out, a second alert is raised and the
//! store stays degraded until [`PersistenceStore::trigger_recovery`] or a
//! restart. Reads and writes against memory keep working throughout.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use gantry_core::defaults;
use gantry_core::{AlertLevel, Error, ErrorSink, Job, PersistenceHealth, Result};

use crate::backend::DurableBackend;

type RecordKey = (String, String);

/// Configuration for the persistence store.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Periodic flush interval in normal mode.
    pub flush_interval: Duration,
    /// Consecutive flush failures before entering degraded mode.
    pub failure_threshold: u32,
    /// Delay before the first recovery attempt; doubles per attempt.
    pub recovery_base_delay: Duration,
    /// Ceiling on the recovery delay.
    pub recovery_max_delay: Duration,
    /// Recovery attempts per degraded episode.
    pub max_recovery_attempts: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(defaults::FLUSH_INTERVAL_MS),
            failure_threshold: defaults::FLUSH_FAILURE_THRESHOLD,
            recovery_base_delay: Duration::from_millis(defaults::RECOVERY_BASE_DELAY_MS),
            recovery_max_delay: Duration::from_millis(defaults::RECOVERY_MAX_DELAY_MS),
            max_recovery_attempts: defaults::MAX_RECOVERY_ATTEMPTS,
        }
    }
}

impl PersistenceConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GANTRY_FLUSH_INTERVAL_MS` | `1000` | Periodic flush interval |
    /// | `GANTRY_FLUSH_FAILURE_THRESHOLD` | `5` | Failures before degraded mode |
    /// | `GANTRY_RECOVERY_BASE_DELAY_MS` | `5000` | First recovery delay |
    /// | `GANTRY_RECOVERY_MAX_DELAY_MS` | `300000` | Recovery delay ceiling |
    /// | `GANTRY_MAX_RECOVERY_ATTEMPTS` | `10` | Recovery attempts per episode |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            flush_interval: env_millis("GANTRY_FLUSH_INTERVAL_MS")
                .unwrap_or(base.flush_interval)
                .max(Duration::from_millis(10)),
            failure_threshold: env_parse("GANTRY_FLUSH_FAILURE_THRESHOLD")
                .unwrap_or(base.failure_threshold)
                .max(1),
            recovery_base_delay: env_millis("GANTRY_RECOVERY_BASE_DELAY_MS")
                .unwrap_or(base.recovery_base_delay),
            recovery_max_delay: env_millis("GANTRY_RECOVERY_MAX_DELAY_MS")
                .unwrap_or(base.recovery_max_delay),
            max_recovery_attempts: env_parse("GANTRY_MAX_RECOVERY_ATTEMPTS")
                .unwrap_or(base.max_recovery_attempts),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_delays(mut self, base: Duration, max: Duration) -> Self {
        self.recovery_base_delay = base;
        self.recovery_max_delay = max;
        self
    }

    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Delay before recovery attempt `attempt` (0-based).
    pub fn recovery_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.recovery_base_delay
            .checked_mul(factor)
            .unwrap_or(self.recovery_max_delay)
            .min(self.recovery_max_delay)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Outcome of an explicit [`PersistenceStore::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Number of records written.
    Flushed(usize),
    /// Store is degraded; the recovery task owns flushing.
    Skipped,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<RecordKey, Job>,
    dirty: HashSet<RecordKey>,
    backlog: HashSet<RecordKey>,
    degraded: bool,
    failure_count: u32,
    recovery_attempts: u32,
    recovery_exhausted: bool,
    recovering: bool,
    closed: bool,
}

impl StoreState {
    fn health(&self) -> PersistenceHealth {
        PersistenceHealth {
            degraded: self.degraded,
            failure_count: self.failure_count,
            recovery_attempts: self.recovery_attempts,
            queued_write_count: self.backlog.len(),
            recovery_exhausted: self.recovery_exhausted,
        }
    }
}

struct StoreInner {
    backend: Arc<dyn DurableBackend>,
    config: PersistenceConfig,
    sink: Arc<dyn ErrorSink>,
    state: Mutex<StoreState>,
    /// Serializes flushes so two writers never interleave on the backend.
    flush_lock: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// In-memory job-record store mirrored to durable storage.
#[derive(Clone)]
pub struct PersistenceStore {
    inner: Arc<StoreInner>,
}

impl PersistenceStore {
    /// Open the store, loading every existing record from the backend, and
    /// start the periodic flush task.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(backend, sink), fields(subsystem = "persistence"))]
    pub async fn open(
        backend: Arc<dyn DurableBackend>,
        config: PersistenceConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<Self> {
        let existing = backend
            .load_all()
            .await
            .map_err(|e| Error::Persistence(format!("failed to load job records: {e}")))?;

        let mut state = StoreState::default();
        for job in existing {
            state
                .records
                .insert((job.pipeline_id.clone(), job.id.clone()), job);
        }
        info!(
            record_count = state.records.len(),
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Persistence store opened"
        );

        let (shutdown_tx, _) = watch::channel(false);
        let store = Self {
            inner: Arc::new(StoreInner {
                backend,
                config,
                sink,
                state: Mutex::new(state),
                flush_lock: tokio::sync::Mutex::new(()),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let flusher = tokio::spawn(store.clone().run_flush_loop());
        store.track(flusher);
        Ok(store)
    }

    /// Record a job mutation. Never blocks and never fails.
    pub fn upsert(&self, job: &Job) {
        let key = (job.pipeline_id.clone(), job.id.clone());
        let mut state = self.state();
        if state.closed {
            warn!(pipeline_id = %job.pipeline_id, job_id = %job.id, "Write after store close dropped");
            return;
        }
        state.records.insert(key.clone(), job.clone());
        if state.degraded {
            state.backlog.insert(key.clone());
        }
        state.dirty.insert(key);
    }

    /// Look up one record.
    pub fn get(&self, pipeline_id: &str, job_id: &str) -> Option<Job> {
        self.state()
            .records
            .get(&(pipeline_id.to_string(), job_id.to_string()))
            .cloned()
    }

    /// All records of a pipeline, in creation order.
    pub fn load_pipeline(&self, pipeline_id: &str) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .state()
            .records
            .values()
            .filter(|job| job.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Current health snapshot.
    pub fn get_health(&self) -> PersistenceHealth {
        self.state().health()
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    /// Flush pending writes now.
    ///
    /// While degraded this does nothing and returns [`FlushOutcome::Skipped`];
    /// the recovery task owns flushing until it succeeds.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        if self.state().degraded {
            return Ok(FlushOutcome::Skipped);
        }
        match self.write_dirty().await {
            Ok(count) => {
                self.record_success();
                Ok(FlushOutcome::Flushed(count))
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Restart recovery after bounded attempts ran out.
    ///
    /// Returns `false` when the store is healthy or recovery is already running.
    pub fn trigger_recovery(&self) -> bool {
        {
            let mut state = self.state();
            if !state.degraded || state.recovering || state.closed {
                return false;
            }
            state.recovering = true;
            state.recovery_attempts = 0;
            state.recovery_exhausted = false;
        }
        info!("Persistence recovery triggered");
        self.spawn_recovery();
        true
    }

    /// Stop background tasks and write out what is left.
    ///
    /// While degraded this is a single best-effort attempt; its failure is
    /// alerted but not returned. Health counters are reset afterwards.
    pub async fn close(&self) {
        let degraded = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.degraded
        };
        let _ = self.inner.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }

        match self.write_dirty().await {
            Ok(count) => {
                info!(record_count = count, degraded, "Persistence store closed");
            }
            Err(e) if degraded => {
                error!(error = %e, "Final flush while degraded failed");
                self.inner.sink.capture_exception(
                    &e,
                    &json!({
                        "component": "persistence",
                        "phase": "shutdown",
                        "queued_write_count": self.state().backlog.len(),
                    }),
                );
            }
            Err(e) => {
                warn!(error = %e, "Final flush failed");
            }
        }

        let mut state = self.state();
        state.degraded = false;
        state.failure_count = 0;
        state.recovery_attempts = 0;
        state.recovery_exhausted = false;
        state.recovering = false;
        state.backlog.clear();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Write every dirty record to the backend.
    ///
    /// Records that fail to write (and everything after them) stay dirty.
    /// Records written before the failure leave the backlog either way.
    async fn write_dirty(&self) -> Result<usize> {
        let _guard = self.inner.flush_lock.lock().await;

        let batch: Vec<(RecordKey, Job)> = {
            let mut state = self.state();
            let keys: Vec<RecordKey> = state.dirty.drain().collect();
            keys.into_iter()
                .filter_map(|key| state.records.get(&key).cloned().map(|job| (key, job)))
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        trace!(record_count = batch.len(), "Flushing job records");

        for (index, (_, job)) in batch.iter().enumerate() {
            if let Err(e) = self.inner.backend.upsert(job).await {
                let mut state = self.state();
                Self::settle_written(&mut state, &batch[..index]);
                for (key, _) in &batch[index..] {
                    state.dirty.insert(key.clone());
                }
                return Err(e);
            }
        }

        Self::settle_written(&mut self.state(), &batch);
        Ok(batch.len())
    }

    /// Drop persisted records from the backlog unless they were re-dirtied
    /// while the write was in progress.
    fn settle_written(state: &mut StoreState, written: &[(RecordKey, Job)]) {
        for (key, _) in written {
            if !state.dirty.contains(key) {
                state.backlog.remove(key);
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state();
        if state.failure_count > 0 {
            debug!(previous_failures = state.failure_count, "Flush succeeded, failure counter reset");
        }
        state.failure_count = 0;
    }

    fn record_failure(&self, err: &Error) {
        let enter_degraded = {
            let mut state = self.state();
            state.failure_count += 1;
            warn!(
                error = %err,
                failure_count = state.failure_count,
                threshold = self.inner.config.failure_threshold,
                "Flush to durable storage failed"
            );
            if !state.degraded && state.failure_count >= self.inner.config.failure_threshold {
                state.degraded = true;
                state.recovering = true;
                state.recovery_attempts = 0;
                state.recovery_exhausted = false;
                let pending: Vec<RecordKey> = state.dirty.iter().cloned().collect();
                state.backlog.extend(pending);
                Some((state.failure_count, state.backlog.len()))
            } else {
                None
            }
        };

        if let Some((failure_count, queued)) = enter_degraded {
            error!(
                failure_count,
                queued_write_count = queued,
                "Persistence entering degraded mode"
            );
            self.inner.sink.capture_message(
                "Persistence entered degraded mode",
                AlertLevel::Error,
                &json!({
                    "component": "persistence",
                    "failure_count": failure_count,
                    "queued_write_count": queued,
                    "error": err.to_string(),
                }),
            );
            self.spawn_recovery();
        }
    }

    fn spawn_recovery(&self) {
        let handle = tokio::spawn(self.clone().run_recovery());
        self.track(handle);
    }

    async fn run_flush_loop(self) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if self.state().closed {
                break;
            }
            // Errors are counted inside flush(); nothing else to do here.
            if let Err(e) = self.flush().await {
                debug!(error = %e, "Periodic flush failed");
            }
        }
        debug!("Periodic flush loop stopped");
    }

    async fn run_recovery(self) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let max_attempts = self.inner.config.max_recovery_attempts;

        for attempt in 0..max_attempts {
            if *shutdown_rx.borrow_and_update() {
                return;
            }
            let delay = self.inner.config.recovery_delay(attempt);
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Scheduling persistence recovery");
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut state = self.state();
                if state.closed {
                    return;
                }
                state.recovery_attempts += 1;
            }

            match self.write_dirty().await {
                Ok(count) => {
                    {
                        let mut state = self.state();
                        state.degraded = false;
                        state.failure_count = 0;
                        state.recovery_attempts = 0;
                        state.recovery_exhausted = false;
                        state.recovering = false;
                    }
                    // Drain anything written between the snapshot and exit.
                    let drained = match self.write_dirty().await {
                        Ok(n) => n,
                        Err(e) => {
                            self.record_failure(&e);
                            0
                        }
                    };
                    info!(
                        attempt = attempt + 1,
                        record_count = count + drained,
                        "Persistence recovered, leaving degraded mode"
                    );
                    return;
                }
                Err(e) => {
                    let mut state = self.state();
                    state.failure_count += 1;
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        max_attempts,
                        "Persistence recovery attempt failed"
                    );
                }
            }
        }

        let queued = {
            let mut state = self.state();
            state.recovering = false;
            state.recovery_exhausted = true;
            state.backlog.len()
        };
        error!(
            max_attempts,
            queued_write_count = queued,
            "Persistence recovery exhausted, staying degraded"
        );
        self.inner.sink.capture_message(
            "Persistence recovery exhausted",
            AlertLevel::Error,
            &json!({
                "component": "persistence",
                "recovery_attempts": max_attempts,
                "queued_write_count": queued,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_config_default() {
        let config = PersistenceConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.max_recovery_attempts, 10);
    }

    #[test]
    fn test_recovery_delay_doubles_and_caps() {
        let config = PersistenceConfig::default()
            .with_recovery_delays(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(config.recovery_delay(0), Duration::from_secs(5));
        assert_eq!(config.recovery_delay(1), Duration::from_secs(10));
        assert_eq!(config.recovery_delay(2), Duration::from_secs(20));
        assert_eq!(config.recovery_delay(6), Duration::from_secs(300));
        assert_eq!(config.recovery_delay(40), Duration::from_secs(300));
    }

    #[test]
    fn test_failure_threshold_never_zero() {
        let config = PersistenceConfig::default().with_failure_threshold(0);
        assert_eq!(config.failure_threshold, 1);
    }

    #[test]
    fn test_health_reports_backlog_size() {
        let mut state = StoreState::default();
        state.degraded = true;
        state.backlog.insert(("p".into(), "a".into()));
        state.backlog.insert(("p".into(), "b".into()));
        let health = state.health();
        assert!(health.degraded);
        assert_eq!(health.queued_write_count, 2);
    }
}
