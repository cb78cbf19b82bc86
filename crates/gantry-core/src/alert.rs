//! Error-tracking sink used for operator alerts.
//!
//! Only two paths raise alerts: persistence entering or failing to leave
//! degraded mode, and a pipeline's construction circuit breaker opening.
//! Everything else is plain logging.

use std::fmt;

use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

/// Severity of a captured message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
        })
    }
}

/// Destination for operator-facing alerts (Sentry or similar).
pub trait ErrorSink: Send + Sync {
    /// Report an error together with structured context.
    fn capture_exception(&self, error: &(dyn std::error::Error + Send + Sync), context: &JsonValue);

    /// Report a message with a severity and structured context.
    fn capture_message(&self, message: &str, level: AlertLevel, context: &JsonValue);
}

/// Default sink: forwards alerts to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn capture_exception(&self, err: &(dyn std::error::Error + Send + Sync), context: &JsonValue) {
        error!(error = %err, context = %context, "Captured exception");
    }

    fn capture_message(&self, message: &str, level: AlertLevel, context: &JsonValue) {
        match level {
            AlertLevel::Error => error!(context = %context, "{message}"),
            AlertLevel::Warning => warn!(context = %context, "{message}"),
            AlertLevel::Info => info!(context = %context, "{message}"),
        }
    }
}
