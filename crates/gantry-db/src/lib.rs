//! # gantry-db
//!
//! Durable job-record storage for gantry.
//!
//! This crate provides:
//! - The [`DurableBackend`] trait with filesystem and in-memory implementations
//! - [`PersistenceStore`], an in-memory record map mirrored to a backend that
//!   keeps serving the scheduler when the backend fails (degraded mode)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gantry_db::{FilesystemBackend, PersistenceConfig, PersistenceStore};
//! use gantry_core::TracingErrorSink;
//!
//! let backend = Arc::new(FilesystemBackend::new("/var/lib/gantry"));
//! let store = PersistenceStore::open(backend, PersistenceConfig::from_env(), Arc::new(TracingErrorSink)).await?;
//!
//! store.upsert(&job);
//! println!("{:?}", store.get_health());
//! store.close().await;
//! ```

pub mod backend;
pub mod memory;
pub mod persistence;

pub use backend::{DurableBackend, FilesystemBackend};
pub use memory::MemoryBackend;
pub use persistence::{FlushOutcome, PersistenceConfig, PersistenceStore};
