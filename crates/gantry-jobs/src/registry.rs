//! Worker registry: lazily constructed, deduplicated, circuit-broken
//! pipeline schedulers.
//!
//! [`WorkerRegistry::get_or_create`] is the only way a scheduler comes into
//! existence. Under one lock it checks, in order: the disabled set, the
//! constructed map (fast path), the pipeline's circuit breaker, and the
//! in-flight construction map. The check and the in-flight reservation are a
//! single critical section, so concurrent callers for the same pipeline all
//! await one shared construction and at most one scheduler per pipeline ever
//! exists.
//!
//! ## Circuit breaker
//!
//! After `circuit_threshold` consecutive construction failures the circuit
//! opens. Calls fail fast with [`Error::CircuitOpen`] until the cooldown
//! (`base * 2^exponent`, capped) has elapsed since the last failure; then one
//! caller is let through as a probe while the rest keep failing with
//! `probing = true`. A successful probe closes the circuit and resets it. A
//! failed probe increments both the failure count and the cooldown exponent,
//! so each failed probe doubles the next wait.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use gantry_core::{
    defaults, validate_identifier, AlertLevel, CircuitSnapshot, Error, ErrorSink, EventBus, Job,
    JobOptions, JobStatus, PersistenceHealth, QueueStats, Result,
};
use gantry_db::PersistenceStore;

use crate::handler::JobHandler;
use crate::scheduler::{JobScheduler, SchedulerConfig};

/// Cooldown exponent ceiling; the configured maximum cooldown caps first in practice.
const MAX_COOLDOWN_EXPONENT: u32 = 16;

/// Configuration for the worker registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Pipelines allowed to construct at the same time, across all ids.
    pub max_concurrent_inits: usize,
    /// Limit on one construction (factory plus handler initialization).
    pub init_timeout: Duration,
    /// Consecutive construction failures that open the circuit.
    pub circuit_threshold: u32,
    /// First cooldown after the circuit opens.
    pub circuit_base_cooldown: Duration,
    /// Cooldown ceiling.
    pub circuit_max_cooldown: Duration,
    /// How long shutdown waits for running jobs per pipeline.
    pub shutdown_drain: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_inits: defaults::MAX_CONCURRENT_INITS,
            init_timeout: Duration::from_secs(defaults::INIT_TIMEOUT_SECS),
            circuit_threshold: defaults::CIRCUIT_FAILURE_THRESHOLD,
            circuit_base_cooldown: Duration::from_millis(defaults::CIRCUIT_BASE_COOLDOWN_MS),
            circuit_max_cooldown: Duration::from_millis(defaults::CIRCUIT_MAX_COOLDOWN_MS),
            shutdown_drain: Duration::from_secs(defaults::SHUTDOWN_DRAIN_SECS),
        }
    }
}

impl RegistryConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GANTRY_MAX_CONCURRENT_INITS` | `3` | Simultaneous pipeline constructions |
    /// | `GANTRY_INIT_TIMEOUT_SECS` | `30` | Construction timeout |
    /// | `GANTRY_CIRCUIT_THRESHOLD` | `3` | Failures before the circuit opens |
    /// | `GANTRY_CIRCUIT_BASE_COOLDOWN_MS` | `5000` | First cooldown |
    /// | `GANTRY_CIRCUIT_MAX_COOLDOWN_MS` | `300000` | Cooldown ceiling |
    /// | `GANTRY_SHUTDOWN_DRAIN_SECS` | `30` | Drain wait per pipeline on shutdown |
    pub fn from_env() -> Self {
        let base = Self::default();
        let parse_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());

        Self {
            max_concurrent_inits: std::env::var("GANTRY_MAX_CONCURRENT_INITS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(base.max_concurrent_inits)
                .max(1),
            init_timeout: parse_u64("GANTRY_INIT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.init_timeout),
            circuit_threshold: std::env::var("GANTRY_CIRCUIT_THRESHOLD")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(base.circuit_threshold)
                .max(1),
            circuit_base_cooldown: parse_u64("GANTRY_CIRCUIT_BASE_COOLDOWN_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.circuit_base_cooldown),
            circuit_max_cooldown: parse_u64("GANTRY_CIRCUIT_MAX_COOLDOWN_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.circuit_max_cooldown),
            shutdown_drain: parse_u64("GANTRY_SHUTDOWN_DRAIN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.shutdown_drain),
        }
    }

    pub fn with_max_concurrent_inits(mut self, max: usize) -> Self {
        self.max_concurrent_inits = max.max(1);
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_circuit_threshold(mut self, threshold: u32) -> Self {
        self.circuit_threshold = threshold.max(1);
        self
    }

    pub fn with_circuit_cooldown(mut self, base: Duration, max: Duration) -> Self {
        self.circuit_base_cooldown = base;
        self.circuit_max_cooldown = max;
        self
    }

    pub fn with_shutdown_drain(mut self, drain: Duration) -> Self {
        self.shutdown_drain = drain;
        self
    }

    /// Cooldown for a given exponent: `base * 2^exponent`, capped.
    pub fn cooldown(&self, exponent: u32) -> Duration {
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.circuit_base_cooldown
            .checked_mul(factor)
            .unwrap_or(self.circuit_max_cooldown)
            .min(self.circuit_max_cooldown)
    }
}

// =============================================================================
// Construction recipes
// =============================================================================

/// Builds the handler for a pipeline. Called at most once per successful
/// construction; a returned error counts against the circuit breaker.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn create(&self, pipeline_id: &str) -> Result<Arc<dyn JobHandler>>;
}

#[async_trait]
impl<F, Fut> PipelineFactory for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn JobHandler>>> + Send,
{
    async fn create(&self, pipeline_id: &str) -> Result<Arc<dyn JobHandler>> {
        (self)(pipeline_id.to_string()).await
    }
}

/// Everything needed to construct one pipeline's scheduler.
#[derive(Clone)]
pub struct PipelineRegistration {
    pub pipeline_id: String,
    pub config: SchedulerConfig,
    pub factory: Arc<dyn PipelineFactory>,
}

impl PipelineRegistration {
    pub fn new(pipeline_id: impl Into<String>, factory: impl PipelineFactory + 'static) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            config: SchedulerConfig::default(),
            factory: Arc::new(factory),
        }
    }

    /// Registration whose factory hands out an existing handler.
    pub fn from_handler(pipeline_id: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self::new(pipeline_id, move |_pipeline_id: String| {
            let handler = handler.clone();
            async move { Ok::<_, Error>(handler) }
        })
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    last_attempt_at: Option<Instant>,
    cooldown_exponent: u32,
    probe_in_flight: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Closed,
    Probe,
    Blocked { retry_after: Duration, probing: bool },
}

impl CircuitState {
    fn is_open(&self, config: &RegistryConfig) -> bool {
        self.consecutive_failures >= config.circuit_threshold
    }

    fn remaining(&self, config: &RegistryConfig, now: Instant) -> Duration {
        let cooldown = config.cooldown(self.cooldown_exponent);
        match self.last_attempt_at {
            Some(at) => cooldown.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    fn admit(&mut self, config: &RegistryConfig, now: Instant) -> Admission {
        if !self.is_open(config) {
            return Admission::Closed;
        }
        if self.probe_in_flight {
            return Admission::Blocked {
                retry_after: config.init_timeout,
                probing: true,
            };
        }
        let remaining = self.remaining(config, now);
        if !remaining.is_zero() {
            return Admission::Blocked {
                retry_after: remaining,
                probing: false,
            };
        }
        self.probe_in_flight = true;
        Admission::Probe
    }

    fn record_success(&mut self) {
        *self = Self::default();
    }

    fn record_failure(&mut self, was_probe: bool, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt_at = Some(now);
        if was_probe {
            self.probe_in_flight = false;
            self.cooldown_exponent = (self.cooldown_exponent + 1).min(MAX_COOLDOWN_EXPONENT);
        }
    }

    fn snapshot(&self, config: &RegistryConfig, now: Instant) -> CircuitSnapshot {
        let open = self.is_open(config);
        CircuitSnapshot {
            consecutive_failures: self.consecutive_failures,
            cooldown_exponent: self.cooldown_exponent,
            open,
            probing: self.probe_in_flight,
            retry_after_ms: open
                .then(|| self.remaining(config, now).as_millis() as u64)
                .filter(|ms| *ms > 0),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

type SharedConstruction = Shared<BoxFuture<'static, Result<JobScheduler>>>;

/// Wiring run once per constructed scheduler, before it is published.
pub type WorkerHook = Arc<dyn Fn(&JobScheduler) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    recipes: HashMap<String, PipelineRegistration>,
    workers: HashMap<String, JobScheduler>,
    in_flight: HashMap<String, SharedConstruction>,
    circuits: HashMap<String, CircuitState>,
    disabled: HashSet<String>,
    shutting_down: bool,
}

struct RegistryInner {
    config: RegistryConfig,
    store: PersistenceStore,
    events: EventBus,
    sink: Arc<dyn ErrorSink>,
    init_permits: Arc<Semaphore>,
    hooks: RwLock<Vec<WorkerHook>>,
    state: Mutex<RegistryState>,
}

/// Map from pipeline id to its scheduler. Owned by the process entry point
/// and shared by cloning.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new(
        config: RegistryConfig,
        store: PersistenceStore,
        events: EventBus,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                init_permits: Arc::new(Semaphore::new(config.max_concurrent_inits.max(1))),
                config,
                store,
                events,
                sink,
                hooks: RwLock::new(Vec::new()),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register a construction recipe. Nothing is constructed yet.
    pub fn register(&self, registration: PipelineRegistration) -> Result<()> {
        validate_identifier("pipeline id", &registration.pipeline_id)?;
        let mut state = self.state();
        if state.recipes.contains_key(&registration.pipeline_id) {
            return Err(Error::Config(format!(
                "pipeline {} is already registered",
                registration.pipeline_id
            )));
        }
        debug!(pipeline_id = %registration.pipeline_id, "Pipeline registered");
        state
            .recipes
            .insert(registration.pipeline_id.clone(), registration);
        Ok(())
    }

    /// Registered pipeline ids, sorted.
    pub fn pipelines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().recipes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register wiring that runs once for every scheduler this registry
    /// constructs, before any caller can see it.
    pub fn on_worker_created<F>(&self, hook: F)
    where
        F: Fn(&JobScheduler) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Already-constructed scheduler, if any. Never constructs.
    pub fn get(&self, pipeline_id: &str) -> Option<JobScheduler> {
        self.state().workers.get(pipeline_id).cloned()
    }

    /// Return the pipeline's scheduler, constructing it on first use.
    pub async fn get_or_create(&self, pipeline_id: &str) -> Result<JobScheduler> {
        let construction = {
            let mut state = self.state();
            if state.disabled.contains(pipeline_id) {
                return Err(Error::PipelineDisabled(pipeline_id.to_string()));
            }
            if let Some(worker) = state.workers.get(pipeline_id) {
                return Ok(worker.clone());
            }
            if state.shutting_down {
                return Err(Error::ShuttingDown("worker registry".to_string()));
            }
            let recipe = state
                .recipes
                .get(pipeline_id)
                .cloned()
                .ok_or_else(|| Error::UnknownPipeline(pipeline_id.to_string()))?;

            let admission = state
                .circuits
                .entry(pipeline_id.to_string())
                .or_default()
                .admit(&self.inner.config, Instant::now());
            let is_probe = match admission {
                Admission::Closed => false,
                Admission::Probe => {
                    info!(pipeline_id, "Circuit half-open, letting one construction probe through");
                    true
                }
                Admission::Blocked {
                    retry_after,
                    probing,
                } => {
                    debug!(
                        pipeline_id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        probing,
                        "Construction blocked by open circuit"
                    );
                    return Err(Error::CircuitOpen {
                        pipeline_id: pipeline_id.to_string(),
                        retry_after_ms: (retry_after.as_millis() as u64).max(1),
                        probing,
                    });
                }
            };

            match state.in_flight.get(pipeline_id).cloned() {
                Some(pending) => {
                    debug!(pipeline_id, "Joining in-flight construction");
                    pending
                }
                None => {
                    let pending = self.spawn_construction(recipe, is_probe);
                    state
                        .in_flight
                        .insert(pipeline_id.to_string(), pending.clone());
                    pending
                }
            }
        };
        construction.await
    }

    /// Submit a job, constructing the pipeline if needed.
    pub async fn submit_job(
        &self,
        pipeline_id: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<Job> {
        self.get_or_create(pipeline_id).await?.submit(payload, options)
    }

    /// Look up a job. Unconstructed pipelines answer from the store.
    pub fn get_job(&self, pipeline_id: &str, job_id: &str) -> Result<Job> {
        let job = match self.get(pipeline_id) {
            Some(worker) => worker.get_job(job_id),
            None => {
                self.ensure_registered(pipeline_id)?;
                self.inner.store.get(pipeline_id, job_id)
            }
        };
        job.ok_or_else(|| Error::JobNotFound {
            pipeline_id: pipeline_id.to_string(),
            job_id: job_id.to_string(),
        })
    }

    /// Cancel a job. See [`JobScheduler::cancel`].
    pub async fn cancel_job(&self, pipeline_id: &str, job_id: &str) -> Result<bool> {
        match self.get(pipeline_id) {
            Some(worker) => worker.cancel(job_id),
            None => self.get_or_create(pipeline_id).await?.cancel(job_id),
        }
    }

    /// Queue statistics for one pipeline. Never constructs.
    pub fn get_stats(&self, pipeline_id: &str) -> Result<QueueStats> {
        if let Some(worker) = self.get(pipeline_id) {
            return Ok(worker.stats());
        }
        let max_concurrent = self
            .state()
            .recipes
            .get(pipeline_id)
            .map(|recipe| recipe.config.max_concurrent)
            .ok_or_else(|| Error::UnknownPipeline(pipeline_id.to_string()))?;
        Ok(stats_from_records(
            &self.inner.store.load_pipeline(pipeline_id),
            max_concurrent,
        ))
    }

    /// Statistics for every registered pipeline.
    pub fn get_all_stats(&self) -> BTreeMap<String, QueueStats> {
        self.pipelines()
            .into_iter()
            .filter_map(|id| self.get_stats(&id).ok().map(|stats| (id, stats)))
            .collect()
    }

    /// Persistence health for monitoring. Never fails.
    pub fn get_health(&self) -> PersistenceHealth {
        self.inner.store.get_health()
    }

    /// The event bus every scheduler publishes to.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.inner.store
    }

    /// Administratively disable a pipeline: `get_or_create` fails with
    /// `PipelineDisabled` and a constructed scheduler stops dequeuing.
    pub fn disable(&self, pipeline_id: &str) -> Result<()> {
        let worker = {
            let mut state = self.state();
            if !state.recipes.contains_key(pipeline_id) {
                return Err(Error::UnknownPipeline(pipeline_id.to_string()));
            }
            state.disabled.insert(pipeline_id.to_string());
            state.workers.get(pipeline_id).cloned()
        };
        if let Some(worker) = worker {
            worker.pause();
        }
        warn!(pipeline_id, "Pipeline disabled");
        Ok(())
    }

    pub fn enable(&self, pipeline_id: &str) -> Result<()> {
        let worker = {
            let mut state = self.state();
            if !state.recipes.contains_key(pipeline_id) {
                return Err(Error::UnknownPipeline(pipeline_id.to_string()));
            }
            if !state.disabled.remove(pipeline_id) {
                return Ok(());
            }
            state.workers.get(pipeline_id).cloned()
        };
        if let Some(worker) = worker {
            worker.resume();
        }
        info!(pipeline_id, "Pipeline enabled");
        Ok(())
    }

    pub fn is_disabled(&self, pipeline_id: &str) -> bool {
        self.state().disabled.contains(pipeline_id)
    }

    /// Current circuit breaker state of a pipeline.
    pub fn circuit_state(&self, pipeline_id: &str) -> CircuitSnapshot {
        self.state()
            .circuits
            .get(pipeline_id)
            .map(|circuit| circuit.snapshot(&self.inner.config, Instant::now()))
            .unwrap_or_default()
    }

    /// Wait for in-flight constructions, drain every scheduler, then close
    /// the persistence store.
    #[instrument(skip(self), fields(subsystem = "registry"))]
    pub async fn shutdown(&self) {
        let pending: Vec<SharedConstruction> = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.in_flight.values().cloned().collect()
        };
        info!(in_flight = pending.len(), "Worker registry shutting down");
        for construction in pending {
            let _ = construction.await;
        }

        let workers: Vec<JobScheduler> = self.state().workers.values().cloned().collect();
        let drain = self.inner.config.shutdown_drain;
        futures::future::join_all(workers.iter().map(|worker| worker.shutdown(drain))).await;

        self.inner.store.close().await;
        info!(pipelines = workers.len(), "Worker registry stopped");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_registered(&self, pipeline_id: &str) -> Result<()> {
        if self.state().recipes.contains_key(pipeline_id) {
            Ok(())
        } else {
            Err(Error::UnknownPipeline(pipeline_id.to_string()))
        }
    }

    /// Run the construction on its own task so it completes even if every
    /// waiting caller goes away.
    fn spawn_construction(&self, recipe: PipelineRegistration, is_probe: bool) -> SharedConstruction {
        let registry = self.clone();
        let pipeline_id = recipe.pipeline_id.clone();
        let started = std::time::Instant::now();
        let task = tokio::spawn(self.clone().construct(recipe, is_probe));
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => registry.settle(
                    &pipeline_id,
                    Err(Error::Internal(format!(
                        "construction task for {pipeline_id} failed: {e}"
                    ))),
                    is_probe,
                    started.elapsed(),
                ),
            }
        }
        .boxed()
        .shared()
    }

    async fn construct(self, recipe: PipelineRegistration, is_probe: bool) -> Result<JobScheduler> {
        let pipeline_id = recipe.pipeline_id.clone();
        let started = std::time::Instant::now();

        let result = match self.build(&recipe).await {
            Ok(worker) => self.run_hooks(&pipeline_id, worker),
            Err(e) => Err(e),
        };

        self.settle(&pipeline_id, result, is_probe, started.elapsed())
    }

    /// Run the `on_worker_created` hooks. A panicking hook discards the worker.
    fn run_hooks(&self, pipeline_id: &str, worker: JobScheduler) -> Result<JobScheduler> {
        let hooks: Vec<WorkerHook> = self
            .inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            for hook in &hooks {
                hook(&worker);
            }
        }));
        match outcome {
            Ok(()) => Ok(worker),
            Err(_panic) => Err(Error::Construction {
                pipeline_id: pipeline_id.to_string(),
                message: "worker hook panicked".to_string(),
            }),
        }
    }

    async fn build(&self, recipe: &PipelineRegistration) -> Result<JobScheduler> {
        let pipeline_id = recipe.pipeline_id.as_str();
        let _permit = self
            .inner
            .init_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown("construction limiter closed".to_string()))?;

        let timeout = self.inner.config.init_timeout;
        let work = async {
            let handler = recipe.factory.create(pipeline_id).await?;
            handler.initialize().await?;
            Ok::<_, Error>(handler)
        };

        let handler = match tokio::time::timeout(timeout, AssertUnwindSafe(work).catch_unwind()).await
        {
            Err(_) => {
                return Err(Error::InitTimeout {
                    pipeline_id: pipeline_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_panic)) => {
                return Err(Error::Construction {
                    pipeline_id: pipeline_id.to_string(),
                    message: "factory panicked".to_string(),
                })
            }
            Ok(Ok(Err(e @ Error::Construction { .. }))) => return Err(e),
            Ok(Ok(Err(e))) => {
                return Err(Error::Construction {
                    pipeline_id: pipeline_id.to_string(),
                    message: e.to_string(),
                })
            }
            Ok(Ok(Ok(handler))) => handler,
        };

        Ok(JobScheduler::new(
            pipeline_id,
            recipe.config.clone(),
            handler,
            self.inner.store.clone(),
            self.inner.events.clone(),
        ))
    }

    /// Publish or record the failure, atomically with clearing the in-flight slot.
    fn settle(
        &self,
        pipeline_id: &str,
        result: Result<JobScheduler>,
        is_probe: bool,
        elapsed: Duration,
    ) -> Result<JobScheduler> {
        let config = &self.inner.config;
        let tripped = {
            let mut state = self.state();
            let RegistryState {
                in_flight,
                circuits,
                workers,
                ..
            } = &mut *state;
            in_flight.remove(pipeline_id);
            let circuit = circuits.entry(pipeline_id.to_string()).or_default();

            match &result {
                Ok(worker) => {
                    let recovered = circuit.consecutive_failures > 0;
                    circuit.record_success();
                    workers.insert(pipeline_id.to_string(), worker.clone());
                    info!(
                        pipeline_id,
                        duration_ms = elapsed.as_millis() as u64,
                        recovered,
                        "Pipeline worker constructed"
                    );
                    None
                }
                Err(e) => {
                    let was_open = circuit.is_open(config);
                    circuit.record_failure(is_probe, Instant::now());
                    let cooldown = config.cooldown(circuit.cooldown_exponent);
                    warn!(
                        pipeline_id,
                        error = %e,
                        consecutive_failures = circuit.consecutive_failures,
                        probe = is_probe,
                        "Pipeline construction failed"
                    );
                    if circuit.is_open(config) && !was_open {
                        Some((circuit.consecutive_failures, cooldown))
                    } else {
                        if is_probe {
                            warn!(
                                pipeline_id,
                                cooldown_ms = cooldown.as_millis() as u64,
                                cooldown_exponent = circuit.cooldown_exponent,
                                "Construction probe failed, circuit re-opened"
                            );
                        }
                        None
                    }
                }
            }
        };

        if let (Some((failures, cooldown)), Err(e)) = (tripped, &result) {
            error!(
                pipeline_id,
                consecutive_failures = failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "Pipeline construction circuit opened"
            );
            self.inner.sink.capture_message(
                "Pipeline construction circuit opened",
                AlertLevel::Error,
                &json!({
                    "component": "registry",
                    "pipeline_id": pipeline_id,
                    "consecutive_failures": failures,
                    "cooldown_ms": cooldown.as_millis() as u64,
                    "error": e.to_string(),
                }),
            );
        }
        result
    }
}

/// Stats for a pipeline that has not been constructed, derived from its
/// stored records. Interrupted `running` records count as queued since that
/// is what construction will turn them into.
fn stats_from_records(records: &[Job], max_concurrent: usize) -> QueueStats {
    let mut stats = QueueStats {
        max_concurrent,
        ..QueueStats::default()
    };
    for job in records {
        match job.status {
            JobStatus::Queued | JobStatus::Running => stats.queued += 1,
            JobStatus::Paused => stats.paused += 1,
            JobStatus::Completed => stats.completed += 1,
            JobStatus::Failed => stats.failed += 1,
            JobStatus::Cancelled => stats.cancelled += 1,
        }
    }
    stats
}
