//! # gantry-jobs
//!
//! Job orchestration core for gantry.
//!
//! This crate provides:
//! - Per-pipeline bounded-concurrency job scheduling with FIFO dequeue
//! - Classified retry: transient failures back off exponentially, permanent
//!   ones fail fast
//! - Lifecycle events published on a shared [`EventBus`]
//! - A worker registry that constructs each pipeline once, limits concurrent
//!   construction, and circuit-breaks pipelines that keep failing to start
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gantry_jobs::{
//!     EventBus, FilesystemBackend, JobOptions, NoOpHandler, PersistenceConfig,
//!     PersistenceStore, PipelineRegistration, RegistryConfig, TracingErrorSink,
//!     WorkerRegistry,
//! };
//!
//! let sink = Arc::new(TracingErrorSink);
//! let backend = Arc::new(FilesystemBackend::new("/var/lib/gantry"));
//! let store = PersistenceStore::open(backend, PersistenceConfig::from_env(), sink.clone()).await?;
//!
//! let registry = WorkerRegistry::new(RegistryConfig::from_env(), store, EventBus::default(), sink);
//! registry.register(PipelineRegistration::from_handler("noop", Arc::new(NoOpHandler::new())))?;
//!
//! // Listen for events
//! let mut events = registry.events().subscribe();
//!
//! let job = registry.submit_job("noop", serde_json::json!({}), JobOptions::new()).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{}: {}", event.event_type, event.payload.job_id());
//! }
//!
//! // Graceful shutdown
//! registry.shutdown().await;
//! ```

pub mod classifier;
pub mod handler;
pub mod job_error;
pub mod registry;
pub mod scheduler;

// Re-export core types
pub use gantry_core::*;

// Re-export persistence types used when wiring a registry
pub use gantry_db::{
    DurableBackend, FilesystemBackend, FlushOutcome, MemoryBackend, PersistenceConfig,
    PersistenceStore,
};

pub use classifier::{ClassifierConfig, ErrorClassifier};
pub use handler::{FnHandler, JobContext, JobHandler, JobResult, NoOpHandler, ProgressCallback};
pub use job_error::{ErrorCode, JobError};
pub use registry::{
    PipelineFactory, PipelineRegistration, RegistryConfig, WorkerHook, WorkerRegistry,
};
pub use scheduler::{JobScheduler, SchedulerConfig};

/// Default maximum retries for failed jobs.
pub const DEFAULT_MAX_RETRIES: u32 = gantry_core::defaults::JOB_MAX_RETRIES;

/// Default maximum concurrent jobs per pipeline.
pub const DEFAULT_MAX_CONCURRENT: usize = gantry_core::defaults::JOB_MAX_CONCURRENT;
