//! Built-in pipelines hosted by the daemon.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use gantry_core::{Error, Result};
use gantry_db::PersistenceStore;
use gantry_jobs::{
    ErrorCode, JobContext, JobError, JobHandler, JobResult, PipelineRegistration, SchedulerConfig,
};

use crate::config::DaemonConfig;

pub const HEALTH_CHECK: &str = "health-check";
pub const SCRATCH_CLEANUP: &str = "scratch-cleanup";

/// Registrations for every built-in pipeline. Nothing is constructed until
/// the first job for a pipeline arrives.
pub fn registrations(config: &DaemonConfig, store: &PersistenceStore) -> Vec<PipelineRegistration> {
    let base = SchedulerConfig::from_env().with_max_concurrent(1);

    let health: Arc<dyn JobHandler> = Arc::new(HealthCheckHandler::new(
        config.data_dir.clone(),
        store.clone(),
    ));
    let cleanup: Arc<dyn JobHandler> = Arc::new(ScratchCleanupHandler::new(
        config.scratch_dir(),
        config.scratch_max_age,
    ));

    vec![
        PipelineRegistration::from_handler(HEALTH_CHECK, health)
            .with_config(base.clone().with_max_retries(1)),
        PipelineRegistration::from_handler(SCRATCH_CLEANUP, cleanup).with_config(base),
    ]
}

// =============================================================================
// Health check
// =============================================================================

/// Verifies the data directory accepts writes and reports persistence health.
pub struct HealthCheckHandler {
    data_dir: PathBuf,
    store: PersistenceStore,
}

impl HealthCheckHandler {
    pub fn new(data_dir: PathBuf, store: PersistenceStore) -> Self {
        Self { data_dir, store }
    }

    async fn probe_storage(&self, job_id: &str) -> std::io::Result<()> {
        let probe = self.data_dir.join(format!(".probe-{job_id}"));
        let marker = job_id.as_bytes();
        fs::write(&probe, marker).await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != marker {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "probe read-back mismatch",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    #[instrument(skip(self, ctx), fields(subsystem = "pipelines", pipeline_id = HEALTH_CHECK, job_id = %ctx.job_id()))]
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let start = Instant::now();
        ctx.report_progress(10, Some("Probing data directory"));
        self.probe_storage(ctx.job_id()).await?;

        ctx.report_progress(70, Some("Reading persistence health"));
        let health = self.store.get_health();
        if health.degraded {
            warn!(
                failure_count = health.failure_count,
                queued_write_count = health.queued_write_count,
                recovery_exhausted = health.recovery_exhausted,
                "Persistence is degraded"
            );
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(latency_ms, degraded = health.degraded, "Health check finished");
        ctx.report_progress(100, Some("Done"));

        Ok(Some(json!({
            "storage_ok": true,
            "latency_ms": latency_ms,
            "persistence": {
                "degraded": health.degraded,
                "failure_count": health.failure_count,
                "queued_write_count": health.queued_write_count,
                "recovery_exhausted": health.recovery_exhausted,
            },
        })))
    }

    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).await.map_err(|e| {
            Error::Config(format!(
                "data directory {} is not usable: {e}",
                self.data_dir.display()
            ))
        })
    }
}

// =============================================================================
// Scratch cleanup
// =============================================================================

/// Removes stale files from the scratch directory pipelines write into.
///
/// Payload: `{"max_age_secs": u64}` (optional, overrides the configured age).
/// Subdirectories are left alone.
pub struct ScratchCleanupHandler {
    root: PathBuf,
    max_age: Duration,
}

impl ScratchCleanupHandler {
    pub fn new(root: PathBuf, max_age: Duration) -> Self {
        Self { root, max_age }
    }

    fn max_age_for(&self, payload: &JsonValue) -> std::result::Result<Duration, JobError> {
        match payload.get("max_age_secs") {
            None | Some(JsonValue::Null) => Ok(self.max_age),
            Some(value) => value.as_u64().map(Duration::from_secs).ok_or_else(|| {
                JobError::new(format!(
                    "max_age_secs must be a non-negative integer, got {value}"
                ))
                .with_code(ErrorCode::InvalidArgument)
            }),
        }
    }
}

#[async_trait]
impl JobHandler for ScratchCleanupHandler {
    #[instrument(skip(self, ctx), fields(subsystem = "pipelines", pipeline_id = SCRATCH_CLEANUP, job_id = %ctx.job_id()))]
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let max_age = self.max_age_for(ctx.payload())?;
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "Scratch directory missing, nothing to clean");
                return Ok(Some(json!({ "removed": 0, "kept": 0, "bytes_freed": 0 })));
            }
            Err(e) => return Err(e.into()),
        };

        let (mut removed, mut kept, mut bytes_freed) = (0u64, 0u64, 0u64);
        while let Some(entry) = entries.next_entry().await? {
            if ctx.is_cancelled() {
                return Err(JobError::new(format!(
                    "cleanup interrupted after removing {removed} files"
                )));
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            if metadata.modified()? > cutoff {
                kept += 1;
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    bytes_freed += metadata.len();
                }
                // Raced with another remover.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            removed,
            kept,
            bytes_freed,
            max_age_secs = max_age.as_secs(),
            "Scratch cleanup finished"
        );
        Ok(Some(json!({
            "removed": removed,
            "kept": kept,
            "bytes_freed": bytes_freed,
        })))
    }

    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::Config(format!(
                "scratch directory {} is not usable: {e}",
                self.root.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::test_fixtures::RecordingErrorSink;
    use gantry_core::Job;
    use gantry_db::{MemoryBackend, PersistenceConfig};

    fn ctx(pipeline_id: &str, payload: JsonValue) -> JobContext {
        JobContext::new(Job::new(pipeline_id, "j1", payload, 0))
    }

    async fn store() -> PersistenceStore {
        PersistenceStore::open(
            Arc::new(MemoryBackend::new()),
            PersistenceConfig::default(),
            Arc::new(RecordingErrorSink::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_check_reports_storage_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let handler = HealthCheckHandler::new(dir.path().to_path_buf(), store().await);
        handler.initialize().await.unwrap();

        let result = handler
            .execute(ctx(HEALTH_CHECK, json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["storage_ok"], true);
        assert_eq!(result["persistence"]["degraded"], false);
        // Probe file is cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_health_check_fails_when_data_dir_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let handler = HealthCheckHandler::new(file, store().await);
        assert!(handler.initialize().await.is_err());
        assert!(handler.execute(ctx(HEALTH_CHECK, json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"12345").unwrap();
        std::fs::write(dir.path().join("b.tmp"), b"123").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let handler = ScratchCleanupHandler::new(dir.path().to_path_buf(), Duration::from_secs(3600));

        let fresh = handler
            .execute(ctx(SCRATCH_CLEANUP, json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh["removed"], 0);
        assert_eq!(fresh["kept"], 2);

        let swept = handler
            .execute(ctx(SCRATCH_CLEANUP, json!({ "max_age_secs": 0 })))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept["removed"], 2);
        assert_eq!(swept["bytes_freed"], 8);
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_bad_payload() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ScratchCleanupHandler::new(dir.path().to_path_buf(), Duration::from_secs(60));
        let err = handler
            .execute(ctx(SCRATCH_CLEANUP, json!({ "max_age_secs": "soon" })))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
    }

    #[tokio::test]
    async fn test_cleanup_of_missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ScratchCleanupHandler::new(dir.path().join("absent"), Duration::from_secs(60));
        let result = handler
            .execute(ctx(SCRATCH_CLEANUP, json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["removed"], 0);
    }

    #[tokio::test]
    async fn test_registrations_cover_builtin_pipelines() {
        let config = DaemonConfig::default();
        let ids: Vec<String> = registrations(&config, &store().await)
            .into_iter()
            .map(|r| r.pipeline_id)
            .collect();
        assert_eq!(ids, vec![HEALTH_CHECK, SCRATCH_CLEANUP]);
    }
}
