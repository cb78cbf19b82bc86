//! In-memory backend with write-failure injection.
//!
//! Used by tests across the workspace to simulate an unhealthy disk.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use gantry_core::{Error, Job, Result};

use crate::backend::DurableBackend;

#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<(String, String), Job>>,
    failing: AtomicBool,
    fail_next: AtomicU32,
    write_attempts: AtomicUsize,
    fail_loads: AtomicBool,
    failing_jobs: Mutex<HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with records, as if written by an earlier process.
    pub fn with_records(jobs: impl IntoIterator<Item = Job>) -> Self {
        let backend = Self::default();
        {
            let mut records = backend.records();
            for job in jobs {
                records.insert((job.pipeline_id.clone(), job.id.clone()), job);
            }
        }
        backend
    }

    /// Make every write fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every write of the job with this id fail until healed.
    pub fn fail_job(&self, job_id: &str) {
        self.failing_jobs().insert(job_id.to_string());
    }

    pub fn heal_job(&self, job_id: &str) {
        self.failing_jobs().remove(job_id);
    }

    /// Make loads fail.
    pub fn set_failing_loads(&self, failing: bool) {
        self.fail_loads.store(failing, Ordering::SeqCst);
    }

    /// Total upsert calls, failed or not.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn get(&self, pipeline_id: &str, job_id: &str) -> Option<Job> {
        self.records()
            .get(&(pipeline_id.to_string(), job_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Job>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failing_jobs(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.failing_jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_fail_write(&self, job: &Job) -> bool {
        if self.failing.load(Ordering::SeqCst) || self.failing_jobs().contains(&job.id) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableBackend for MemoryBackend {
    async fn upsert(&self, job: &Job) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail_write(job) {
            return Err(Error::Persistence("injected write failure".to_string()));
        }
        self.records()
            .insert((job.pipeline_id.clone(), job.id.clone()), job.clone());
        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Vec<Job>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Error::Persistence("injected load failure".to_string()));
        }
        Ok(self
            .records()
            .values()
            .filter(|job| job.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Error::Persistence("injected load failure".to_string()));
        }
        Ok(self.records().values().cloned().collect())
    }
}
