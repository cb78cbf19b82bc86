//! Integration tests for the per-pipeline JobScheduler.
//!
//! This test suite validates:
//! - Sched-001: Active jobs never exceed max_concurrent
//! - Sched-002: Retryable failures run exactly max_retries + 1 times
//! - Sched-003: Non-retryable failures run exactly once
//! - Sched-004: FIFO dequeue, retries re-enter at the back
//! - Sched-005: End-to-end event ordering for a retried job
//! - Sched-006: Cancellation of queued and running jobs
//! - Sched-007: Timeouts and panics are contained at the call boundary
//! - Sched-008: Pipeline and per-job pausing
//! - Sched-009: Restart reload from the persistence store
//! - Sched-010: Degraded persistence is invisible to scheduling

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

use gantry_core::test_fixtures::RecordingErrorSink;
use gantry_jobs::{
    ClassifierConfig, Error, ErrorCode, EventBus, EventEnvelope, FnHandler, Job, JobContext,
    JobError, JobEvent, JobHandler, JobOptions, JobResult, JobScheduler, JobStatus, MemoryBackend,
    NoOpHandler, PersistenceConfig, PersistenceStore, SchedulerConfig,
};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

struct Harness {
    scheduler: JobScheduler,
    store: PersistenceStore,
    backend: Arc<MemoryBackend>,
    events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl Harness {
    fn event_types(&self, job_id: &str) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|env| env.payload.job_id() == job_id)
            .map(|env| env.event_type)
            .collect()
    }

    fn count_events(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|env| env.event_type == event_type)
            .count()
    }

    async fn wait_for_event(&self, job_id: &str, event_type: &str) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.event_types(job_id).contains(&event_type)
        })
        .await
    }

    async fn wait_for_status(&self, job_id: &str, status: JobStatus) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.scheduler
                .get_job(job_id)
                .is_some_and(|job| job.status == status)
        })
        .await
    }

    fn job(&self, job_id: &str) -> Job {
        self.scheduler.get_job(job_id).expect("job exists")
    }
}

fn store_config() -> PersistenceConfig {
    PersistenceConfig::default()
        .with_flush_interval(Duration::from_millis(20))
        .with_recovery_delays(Duration::from_millis(10), Duration::from_millis(40))
        .with_max_recovery_attempts(200)
}

/// Scheduler config with millisecond retry backoff.
fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default().with_classifier(
        ClassifierConfig::default()
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50)),
    )
}

async fn harness(config: SchedulerConfig, handler: Arc<dyn JobHandler>) -> Harness {
    harness_with_backend("demo", Arc::new(MemoryBackend::new()), config, handler).await
}

async fn harness_with_backend(
    pipeline_id: &str,
    backend: Arc<MemoryBackend>,
    config: SchedulerConfig,
    handler: Arc<dyn JobHandler>,
) -> Harness {
    let store = PersistenceStore::open(
        backend.clone(),
        store_config(),
        Arc::new(RecordingErrorSink::new()),
    )
    .await
    .expect("open store");

    let bus = EventBus::new(64);
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = events.clone();
    bus.on_any(move |env| recorder.lock().unwrap().push(env.clone()));

    let scheduler = JobScheduler::new(pipeline_id, config, handler, store.clone(), bus);
    Harness {
        scheduler,
        store,
        backend,
        events,
    }
}

fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

fn ok() -> JobResult {
    Ok(None)
}

fn fail(error: JobError) -> JobResult {
    Err(error)
}

/// Poll until `check` holds or the timeout expires.
async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn with_id(id: &str) -> JobOptions {
    JobOptions::new().with_id(id)
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_concurrency_ceiling_never_exceeded() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (c, p) = (current.clone(), peak.clone());
    let handler = handler_fn(move |_ctx| {
        let (current, peak) = (c.clone(), p.clone());
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            ok()
        }
    });

    let h = harness(fast_config().with_max_concurrent(3), handler).await;
    for i in 0..10 {
        h.scheduler
            .submit(json!({ "i": i }), JobOptions::new())
            .unwrap();
        assert!(h.scheduler.stats().active <= 3);
    }

    assert!(wait_until(Duration::from_secs(5), || h.scheduler.stats().completed == 10).await);
    assert_eq!(peak.load(Ordering::SeqCst), 3);

    let stats = h.scheduler.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.max_concurrent, 3);
}

// ============================================================================
// RETRY AND CLASSIFICATION
// ============================================================================

#[tokio::test]
async fn test_retry_bounded_by_max_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let calls = counter.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            fail(JobError::timeout("upstream took too long"))
        }
    });

    let h = harness(fast_config().with_max_retries(2), handler).await;
    h.scheduler.submit(json!({}), with_id("flaky")).unwrap();

    assert!(h.wait_for_event("flaky", "job:failed").await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let job = h.job("flaky");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    let failure = job.error.expect("failure recorded");
    assert!(failure.retryable);
    assert_eq!(failure.code.as_deref(), Some("ETIMEDOUT"));
    assert!(failure.reason.contains("retries exhausted"));
    assert!(job.result.is_none());

    assert_eq!(h.count_events("retry:max-attempts"), 1);
    assert_eq!(
        h.event_types("flaky"),
        vec![
            "job:created",
            "job:started",
            "retry:created",
            "job:started",
            "retry:created",
            "job:started",
            "retry:max-attempts",
            "job:failed",
        ]
    );
}

#[tokio::test]
async fn test_non_retryable_failure_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let calls = counter.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            fail(JobError::new("no such repository").with_code(ErrorCode::NotFound))
        }
    });

    let h = harness(fast_config().with_max_retries(5), handler).await;
    h.scheduler.submit(json!({}), with_id("missing")).unwrap();

    assert!(h.wait_for_event("missing", "job:failed").await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let job = h.job("missing");
    assert_eq!(job.retry_count, 0);
    let failure = job.error.unwrap();
    assert!(!failure.retryable);
    assert!(failure.reason.contains("ENOENT"));
    assert_eq!(h.count_events("retry:created"), 0);
    assert_eq!(h.count_events("retry:max-attempts"), 0);
}

#[tokio::test]
async fn test_per_job_max_retries_override() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let calls = counter.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            fail(JobError::http(503, "service unavailable"))
        }
    });

    let h = harness(fast_config().with_max_retries(5), handler).await;
    h.scheduler
        .submit(json!({}), with_id("once").with_max_retries(0))
        .unwrap();

    assert!(h.wait_for_event("once", "job:failed").await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.job("once").max_retries, 0);
    assert_eq!(h.count_events("retry:max-attempts"), 1);
}

// ============================================================================
// ORDERING
// ============================================================================

#[tokio::test]
async fn test_fifo_order_with_single_slot() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let handler = handler_fn(move |ctx: JobContext| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(ctx.job_id().to_string());
            ok()
        }
    });

    let h = harness(fast_config().with_max_concurrent(1), handler).await;
    for id in ["A", "B", "C"] {
        h.scheduler.submit(json!({}), with_id(id)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || h.scheduler.stats().completed == 3).await);
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_retried_job_reenters_at_back_of_queue() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let handler = handler_fn(move |ctx: JobContext| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(ctx.job_id().to_string());
            if ctx.job_id() == "A" && ctx.attempt() == 1 {
                return fail(JobError::new("socket hang up"));
            }
            sleep(Duration::from_millis(40)).await;
            ok()
        }
    });

    let h = harness(fast_config().with_max_concurrent(1), handler).await;
    for id in ["A", "B", "C"] {
        h.scheduler.submit(json!({}), with_id(id)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || h.scheduler.stats().completed == 3).await);
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C", "A"]);
}

#[tokio::test]
async fn test_end_to_end_retry_then_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let calls = counter.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return fail(JobError::new("peer went away").with_code(ErrorCode::ConnectionReset));
            }
            Ok(Some(json!({ "ok": true })))
        }
    });

    let h = harness(
        fast_config().with_max_concurrent(2).with_max_retries(1),
        handler,
    )
    .await;
    let job = h.scheduler.submit(json!({ "n": 1 }), with_id("j1")).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.payload, json!({ "n": 1 }));

    assert!(h.wait_for_event("j1", "job:completed").await);
    assert_eq!(
        h.event_types("j1"),
        vec![
            "job:created",
            "job:started",
            "retry:created",
            "job:started",
            "job:completed",
        ]
    );

    let job = h.job("j1");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.result, Some(json!({ "ok": true })));
    assert!(job.error.is_none());
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    let retry = h
        .events
        .lock()
        .unwrap()
        .iter()
        .find_map(|env| match &env.payload {
            JobEvent::RetryCreated {
                retry_count,
                delay_ms,
                ..
            } => Some((*retry_count, *delay_ms)),
            _ => None,
        });
    assert_eq!(retry, Some((1, 10)));
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_cancel_queued_job_is_immediate() {
    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    let handler = handler_fn(move |_ctx| {
        let gate = release.clone();
        async move {
            gate.notified().await;
            ok()
        }
    });

    let h = harness(fast_config().with_max_concurrent(1), handler).await;
    h.scheduler.submit(json!({}), with_id("blocker")).unwrap();
    h.scheduler.submit(json!({}), with_id("victim")).unwrap();

    assert!(h.scheduler.cancel("victim").unwrap());
    let victim = h.job("victim");
    assert_eq!(victim.status, JobStatus::Cancelled);
    assert!(victim.result.is_none() && victim.error.is_none());
    assert!(!h.scheduler.cancel("victim").unwrap(), "terminal job cannot be cancelled");
    assert!(matches!(
        h.scheduler.cancel("ghost"),
        Err(Error::JobNotFound { .. })
    ));

    gate.notify_one();
    assert!(h.wait_for_status("blocker", JobStatus::Completed).await);
    assert_eq!(h.event_types("victim"), vec!["job:created", "job:cancelled"]);

    let stats = h.scheduler.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_cancel_running_job_is_cooperative() {
    let handler = handler_fn(|ctx: JobContext| async move {
        tokio::select! {
            _ = ctx.cancelled() => fail(JobError::new("stopped at a safe point")),
            _ = sleep(Duration::from_secs(30)) => ok(),
        }
    });

    let h = harness(fast_config().with_max_retries(3), handler).await;
    h.scheduler.submit(json!({}), with_id("long")).unwrap();
    assert!(h.wait_for_event("long", "job:started").await);

    assert!(h.scheduler.cancel("long").unwrap());
    assert!(h.wait_for_event("long", "job:cancelled").await);

    let job = h.job("long");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.retry_count, 0);
    assert_eq!(
        h.event_types("long"),
        vec!["job:created", "job:started", "job:cancelled"]
    );
}

#[tokio::test]
async fn test_cancel_during_retry_backoff() {
    let handler = handler_fn(|_ctx| async move { fail(JobError::timeout("slow")) });
    let config = fast_config().with_max_retries(3).with_classifier(
        ClassifierConfig::default()
            .with_base_delay(Duration::from_secs(30))
            .with_max_delay(Duration::from_secs(30)),
    );

    let h = harness(config, handler).await;
    h.scheduler.submit(json!({}), with_id("sleepy")).unwrap();
    assert!(h.wait_for_event("sleepy", "retry:created").await);
    assert_eq!(h.job("sleepy").status, JobStatus::Queued);
    assert_eq!(h.scheduler.stats().active, 0, "backoff holds no slot");

    assert!(h.scheduler.cancel("sleepy").unwrap());
    assert_eq!(h.job("sleepy").status, JobStatus::Cancelled);
}

// ============================================================================
// CONTAINMENT
// ============================================================================

#[tokio::test]
async fn test_handler_timeout_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let calls = counter.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                sleep(Duration::from_secs(5)).await;
            }
            ok()
        }
    });

    let config = fast_config()
        .with_max_retries(1)
        .with_job_timeout(Some(Duration::from_millis(30)));
    let h = harness(config, handler).await;
    h.scheduler.submit(json!({}), with_id("hang")).unwrap();

    assert!(h.wait_for_event("hang", "job:completed").await);
    assert_eq!(h.job("hang").retry_count, 1);

    let reason = h.events.lock().unwrap().iter().find_map(|env| match &env.payload {
        JobEvent::RetryCreated { reason, .. } => Some(reason.clone()),
        _ => None,
    });
    assert!(reason.unwrap().contains("ETIMEDOUT"));
}

#[tokio::test]
async fn test_panicking_handler_does_not_break_scheduler() {
    let handler = handler_fn(|ctx: JobContext| async move {
        if ctx.payload()["explode"] == json!(true) {
            panic!("handler blew up");
        }
        ok()
    });

    let h = harness(fast_config().with_max_retries(3).with_max_concurrent(1), handler).await;
    h.scheduler
        .submit(json!({ "explode": true }), with_id("bad"))
        .unwrap();
    h.scheduler
        .submit(json!({ "explode": false }), with_id("good"))
        .unwrap();

    assert!(h.wait_for_status("good", JobStatus::Completed).await);
    let bad = h.job("bad");
    assert_eq!(bad.status, JobStatus::Failed);
    assert_eq!(bad.retry_count, 0);
    let failure = bad.error.unwrap();
    assert_eq!(failure.reason, "handler panicked");
    assert!(failure.message.contains("handler blew up"));
    assert_eq!(h.scheduler.stats().active, 0);
}

// ============================================================================
// PAUSING
// ============================================================================

#[tokio::test]
async fn test_pause_and_resume_pipeline() {
    let h = harness(fast_config(), Arc::new(NoOpHandler::new())).await;
    h.scheduler.pause();
    assert!(h.scheduler.is_paused());
    h.scheduler.submit(json!({}), with_id("held")).unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.job("held").status, JobStatus::Queued);
    assert_eq!(h.scheduler.stats().queued, 1);

    h.scheduler.resume();
    assert!(h.wait_for_status("held", JobStatus::Completed).await);
}

#[tokio::test]
async fn test_paused_job_is_skipped_until_resumed() {
    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    let handler = handler_fn(move |ctx: JobContext| {
        let gate = release.clone();
        async move {
            if ctx.job_id() == "blocker" {
                gate.notified().await;
            }
            ok()
        }
    });

    let h = harness(fast_config().with_max_concurrent(1), handler).await;
    h.scheduler.submit(json!({}), with_id("blocker")).unwrap();
    h.scheduler.submit(json!({}), with_id("A")).unwrap();
    h.scheduler.submit(json!({}), with_id("B")).unwrap();

    assert!(h.scheduler.pause_job("A").unwrap());
    assert!(!h.scheduler.pause_job("A").unwrap(), "already paused");
    assert!(!h.scheduler.pause_job("blocker").unwrap(), "running jobs cannot be held");

    gate.notify_one();
    assert!(h.wait_for_status("B", JobStatus::Completed).await);
    assert_eq!(h.job("A").status, JobStatus::Paused);
    assert_eq!(h.scheduler.stats().paused, 1);

    assert!(h.scheduler.resume_job("A").unwrap());
    assert!(h.wait_for_status("A", JobStatus::Completed).await);
}

// ============================================================================
// SUBMISSION
// ============================================================================

#[tokio::test]
async fn test_submit_rejects_duplicate_and_invalid_ids() {
    let h = harness(fast_config(), Arc::new(NoOpHandler::new())).await;
    h.scheduler.submit(json!({}), with_id("j1")).unwrap();

    assert!(matches!(
        h.scheduler.submit(json!({}), with_id("j1")),
        Err(Error::DuplicateJob { .. })
    ));
    assert!(matches!(
        h.scheduler.submit(json!({}), with_id("../etc")),
        Err(Error::InvalidInput(_))
    ));

    let generated = h.scheduler.submit(json!({}), JobOptions::new()).unwrap();
    assert!(!generated.id.is_empty());
    assert_ne!(generated.id, "j1");
}

#[tokio::test]
async fn test_list_jobs_in_creation_order() {
    let handler = handler_fn(|ctx: JobContext| async move {
        if ctx.job_id() == "second" {
            return fail(JobError::new("bad input").with_code(ErrorCode::InvalidArgument));
        }
        ok()
    });
    let h = harness(fast_config().with_max_concurrent(1), handler).await;
    for id in ["first", "second", "third"] {
        h.scheduler.submit(json!({}), with_id(id)).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        h.scheduler.list_jobs(None).iter().all(|job| job.is_terminal())
    })
    .await);

    let ids: Vec<String> = h.scheduler.list_jobs(None).into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec!["first", "second", "third"]);

    let failed = h.scheduler.list_jobs(Some(JobStatus::Failed));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "second");
}

#[tokio::test]
async fn test_progress_events_between_start_and_completion() {
    let h = harness(fast_config(), Arc::new(NoOpHandler::new())).await;
    h.scheduler.submit(json!({}), with_id("p1")).unwrap();

    assert!(h.wait_for_event("p1", "job:completed").await);
    assert_eq!(
        h.event_types("p1"),
        vec![
            "job:created",
            "job:started",
            "job:progress",
            "job:progress",
            "job:completed",
        ]
    );
}

#[tokio::test]
async fn test_shutdown_stops_accepting_jobs() {
    let h = harness(fast_config(), Arc::new(NoOpHandler::new())).await;
    h.scheduler.submit(json!({}), with_id("before")).unwrap();
    assert!(h.wait_for_status("before", JobStatus::Completed).await);

    h.scheduler.shutdown(Duration::from_secs(1)).await;
    assert!(matches!(
        h.scheduler.submit(json!({}), with_id("after")),
        Err(Error::ShuttingDown(_))
    ));
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[tokio::test]
async fn test_restart_reloads_unfinished_jobs() {
    let now = Utc::now();
    let mut done = Job::new("demo", "done", json!({}), 3);
    done.status = JobStatus::Completed;
    done.created_at = now - chrono::Duration::seconds(30);

    let mut interrupted = Job::new("demo", "interrupted", json!({}), 3);
    interrupted.status = JobStatus::Running;
    interrupted.retry_count = 1;
    interrupted.started_at = Some(now - chrono::Duration::seconds(15));
    interrupted.created_at = now - chrono::Duration::seconds(20);

    let mut waiting = Job::new("demo", "waiting", json!({}), 3);
    waiting.created_at = now - chrono::Duration::seconds(10);

    let other = Job::new("elsewhere", "foreign", json!({}), 3);

    let backend = Arc::new(MemoryBackend::with_records(vec![
        waiting, done, interrupted, other,
    ]));

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let handler = handler_fn(move |ctx: JobContext| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(ctx.job_id().to_string());
            ok()
        }
    });

    let h = harness_with_backend(
        "demo",
        backend,
        fast_config().with_max_concurrent(1),
        handler,
    )
    .await;

    assert!(h.wait_for_status("waiting", JobStatus::Completed).await);
    assert!(h.wait_for_status("interrupted", JobStatus::Completed).await);
    assert_eq!(*order.lock().unwrap(), vec!["interrupted", "waiting"]);

    let interrupted = h.job("interrupted");
    assert_eq!(interrupted.retry_count, 1);
    assert_eq!(interrupted.started_at, Some(now - chrono::Duration::seconds(15)));
    assert!(h.scheduler.get_job("foreign").is_none());

    // Ids loaded from the store stay reserved.
    assert!(matches!(
        h.scheduler.submit(json!({}), with_id("done")),
        Err(Error::DuplicateJob { .. })
    ));
    assert_eq!(h.scheduler.stats().completed, 3);
}

#[tokio::test]
async fn test_degraded_persistence_is_invisible_to_scheduler() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_failing(true);
    let h = harness_with_backend(
        "demo",
        backend.clone(),
        fast_config(),
        Arc::new(NoOpHandler::new()),
    )
    .await;

    for i in 0..5 {
        h.scheduler
            .submit(json!({}), with_id(&format!("job-{i}")))
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || h.store.get_health().degraded).await);
    assert!(wait_until(Duration::from_secs(5), || h.scheduler.stats().completed == 5).await);
    assert_eq!(h.scheduler.stats().failed, 0);

    backend.set_failing(false);
    assert!(wait_until(Duration::from_secs(5), || !h.store.get_health().degraded).await);
    assert_eq!(h.store.get_health().queued_write_count, 0);
    assert!(wait_until(Duration::from_secs(5), || {
        h.backend
            .get("demo", "job-4")
            .is_some_and(|job| job.status == JobStatus::Completed)
    })
    .await);
}
