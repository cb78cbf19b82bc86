//! Structured logging conventions for gantry.
//!
//! Every crate logs through `tracing` with the same field names so log
//! aggregation can query across subsystems.
//!
//! ## Field Names
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `subsystem` | Span field: "jobs", "registry", "persistence" |
//! | `pipeline_id` | Pipeline identifier |
//! | `job_id` | Job identifier within a pipeline |
//! | `attempt` | 1-based handler invocation number |
//! | `duration_ms` | Wall-clock duration in milliseconds |
//! | `delay_ms` | Backoff delay before the next attempt |
//! | `record_count` | Number of records involved in a flush |
//! | `error` | Error message when an operation fails |
//! | `reason` | Classification reason for a handler failure |
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (flushes, queue scans) |
