//! Activity feed: job lifecycle events written to the log.

use tracing::{debug, info, warn};

use gantry_core::{EventEnvelope, JobEvent, ListenerId};
use gantry_jobs::WorkerRegistry;

/// Log every job event and every newly constructed pipeline worker.
pub fn attach(registry: &WorkerRegistry) -> ListenerId {
    registry.on_worker_created(|worker| {
        let config = worker.config();
        info!(
            pipeline_id = worker.pipeline_id(),
            max_concurrent = config.max_concurrent,
            max_retries = config.max_retries,
            "Pipeline worker online"
        );
    });
    registry.events().on_any(record)
}

fn record(envelope: &EventEnvelope) {
    let event = &envelope.payload;
    let (pipeline_id, job_id) = (event.pipeline_id(), event.job_id());
    match event {
        JobEvent::JobFailed { error, reason, .. } => {
            warn!(pipeline_id, job_id, error = %error, reason = %reason, "activity: job failed");
        }
        JobEvent::RetryMaxAttempts { attempts, .. } => {
            warn!(pipeline_id, job_id, attempts, "activity: retries exhausted");
        }
        JobEvent::RetryCreated {
            retry_count,
            delay_ms,
            reason,
            ..
        } => {
            info!(pipeline_id, job_id, retry_count, delay_ms, reason = %reason, "activity: retry scheduled");
        }
        JobEvent::JobCompleted { duration_ms, .. } => {
            info!(pipeline_id, job_id, duration_ms, "activity: job completed");
        }
        JobEvent::JobProgress {
            percent, message, ..
        } => {
            debug!(pipeline_id, job_id, percent, message = message.as_deref(), "activity: progress");
        }
        _ => {
            debug!(pipeline_id, job_id, event_type = envelope.event_type, "activity");
        }
    }
}
