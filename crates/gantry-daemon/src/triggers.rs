//! Interval triggers: cron-style job submission on a fixed period.

use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use gantry_core::Error;
use gantry_jobs::{JobOptions, WorkerRegistry};

/// Submit `payload` to `pipeline_id` every `period` until `shutdown` flips
/// to `true`. The first submission happens immediately.
///
/// Submission failures are logged and the trigger keeps ticking; an open
/// construction circuit just skips the tick.
pub fn spawn_interval_trigger(
    registry: WorkerRegistry,
    pipeline_id: &'static str,
    period: Duration,
    payload: JsonValue,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(pipeline_id, period_secs = period.as_secs(), "Interval trigger started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match registry
                .submit_job(pipeline_id, payload.clone(), JobOptions::new())
                .await
            {
                Ok(job) => debug!(pipeline_id, job_id = %job.id, "Triggered job"),
                Err(Error::CircuitOpen { retry_after_ms, .. }) => {
                    debug!(pipeline_id, retry_after_ms, "Trigger skipped, construction circuit open");
                }
                Err(Error::ShuttingDown(_)) => break,
                Err(e) => warn!(pipeline_id, error = %e, "Trigger failed to submit job"),
            }
        }
        info!(pipeline_id, "Interval trigger stopped");
    })
}
