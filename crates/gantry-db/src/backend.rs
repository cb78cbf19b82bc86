//! Durable byte-store backends for job records.
//!
//! One record per job, keyed by `(pipeline_id, job_id)`. The filesystem layout
//! is `{base_path}/jobs/{pipeline_id}/{job_id}.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use gantry_core::{Job, Result};

/// Storage backend trait for durable job records.
///
/// Allows abstracting over the filesystem, a database, or a test double.
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Insert or replace one job record.
    async fn upsert(&self, job: &Job) -> Result<()>;

    /// Load every record stored for a pipeline.
    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Vec<Job>>;

    /// Load every record across all pipelines.
    async fn load_all(&self) -> Result<Vec<Job>>;
}

/// Filesystem storage backend writing one JSON file per job.
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given base directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn jobs_root(&self) -> PathBuf {
        self.base_path.join("jobs")
    }

    fn record_path(&self, pipeline_id: &str, job_id: &str) -> PathBuf {
        self.jobs_root()
            .join(pipeline_id)
            .join(format!("{job_id}.json"))
    }

    /// Validate that the backend can write, read, and delete files.
    ///
    /// Performs a full round-trip at startup to catch permission errors and
    /// missing directories early.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let test_dir = self.base_path.join(".health-check");
        let test_file = test_dir.join("test.json");

        fs::create_dir_all(&test_dir)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", test_dir, e))?;

        let data = b"{\"storage\":\"health-check\"}";
        fs::write(&test_file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", test_file, e))?;

        let read_data = fs::read(&test_file)
            .await
            .map_err(|e| format!("read({:?}): {}", test_file, e))?;
        if read_data != data {
            return Err("read-back mismatch".to_string());
        }

        fs::remove_file(&test_file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", test_file, e))?;
        let _ = fs::remove_dir(&test_dir).await; // Best-effort cleanup

        Ok(())
    }

    async fn read_dir_records(&self, dir: &Path) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(jobs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<Job>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "job_store: skipping unreadable record");
                }
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl DurableBackend for FilesystemBackend {
    async fn upsert(&self, job: &Job) -> Result<()> {
        let full_path = self.record_path(&job.pipeline_id, &job.id);
        let data = serde_json::to_vec(job)?;
        debug!(full_path = %full_path.display(), size = data.len(), "job_store: write");

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "job_store: create_dir_all failed");
                e
            })?;
        }

        // Atomic write: temp file + rename
        let temp_path = full_path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "job_store: File::create failed");
            e
        })?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "job_store: rename failed");
            e
        })?;

        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Vec<Job>> {
        self.read_dir_records(&self.jobs_root().join(pipeline_id))
            .await
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        let root = self.jobs_root();
        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                jobs.extend(self.read_dir_records(&entry.path()).await?);
            }
        }
        Ok(jobs)
    }
}
