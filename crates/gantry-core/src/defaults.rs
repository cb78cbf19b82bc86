//! Centralized default constants for gantry.
//!
//! **This module is the single source of truth** for shared default values.
//! Config structs in the other crates read their fallbacks from here, and
//! their `from_env()` constructors override them.

// =============================================================================
// SCHEDULER
// =============================================================================

/// Maximum concurrently running jobs per pipeline.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default retry ceiling per job.
pub const JOB_MAX_RETRIES: u32 = 3;

/// Handler execution timeout (seconds). Zero disables the timeout.
pub const JOB_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// RETRY CLASSIFICATION
// =============================================================================

/// Base delay for exponential retry backoff (milliseconds).
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound on a single retry delay (milliseconds). 5 minutes.
pub const RETRY_MAX_DELAY_MS: u64 = 300_000;

// =============================================================================
// WORKER REGISTRY
// =============================================================================

/// Pipelines allowed to initialize at the same time, across all ids.
pub const MAX_CONCURRENT_INITS: usize = 3;

/// Pipeline construction timeout (seconds).
pub const INIT_TIMEOUT_SECS: u64 = 30;

/// Consecutive construction failures that open the circuit.
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;

/// Cooldown before the first half-open probe (milliseconds).
pub const CIRCUIT_BASE_COOLDOWN_MS: u64 = 5_000;

/// Cooldown ceiling after repeated failed probes (milliseconds).
pub const CIRCUIT_MAX_COOLDOWN_MS: u64 = 300_000;

/// Time each scheduler gets to finish active jobs during shutdown (seconds).
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Periodic flush interval in normal mode (milliseconds).
pub const FLUSH_INTERVAL_MS: u64 = 1_000;

/// Consecutive flush failures before entering degraded mode.
pub const FLUSH_FAILURE_THRESHOLD: u32 = 5;

/// First recovery attempt delay while degraded (milliseconds).
pub const RECOVERY_BASE_DELAY_MS: u64 = 5_000;

/// Recovery delay ceiling (milliseconds). 5 minutes.
pub const RECOVERY_MAX_DELAY_MS: u64 = 300_000;

/// Recovery attempts before giving up until restart or explicit trigger.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 10;

// =============================================================================
// EVENTS
// =============================================================================

/// Broadcast buffer for the event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DAEMON
// =============================================================================

/// Root directory for job records and pipeline scratch space.
pub const DATA_DIR: &str = "./data";

/// How often the health-check pipeline is triggered (seconds).
pub const HEALTH_INTERVAL_SECS: u64 = 60;

/// How often the scratch-cleanup pipeline is triggered (seconds).
pub const CLEANUP_INTERVAL_SECS: u64 = 3_600;

/// Scratch files older than this are removed by cleanup (seconds). 24 hours.
pub const SCRATCH_MAX_AGE_SECS: u64 = 86_400;
