//! # gantry-core
//!
//! Core types, events, and abstractions for the gantry job orchestrator.
//!
//! This crate provides the data model shared by the persistence layer and the
//! scheduling core, the event bus used to publish job lifecycle events, and
//! the error-tracking sink used for operator alerts.

pub mod alert;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;

// Note: Always compiled so integration tests in other crates can use it.
pub mod test_fixtures;

// Re-export commonly used types at crate root
pub use alert::{AlertLevel, ErrorSink, TracingErrorSink};
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, EventKind, JobEvent, ListenerId};
pub use models::*;
