//! Shared test doubles.
//!
//! Always compiled so integration tests in other crates can use them.

use std::sync::{Mutex, PoisonError};

use serde_json::Value as JsonValue;

use crate::alert::{AlertLevel, ErrorSink};

/// One alert captured by [`RecordingErrorSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAlert {
    pub message: String,
    /// `None` for captured exceptions.
    pub level: Option<AlertLevel>,
    pub context: JsonValue,
}

/// Error sink that remembers every alert.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    alerts: Mutex<Vec<CapturedAlert>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<CapturedAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of alerts whose message contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|alert| alert.message.contains(needle))
            .count()
    }

    fn push(&self, alert: CapturedAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}

impl ErrorSink for RecordingErrorSink {
    fn capture_exception(&self, error: &(dyn std::error::Error + Send + Sync), context: &JsonValue) {
        self.push(CapturedAlert {
            message: error.to_string(),
            level: None,
            context: context.clone(),
        });
    }

    fn capture_message(&self, message: &str, level: AlertLevel, context: &JsonValue) {
        self.push(CapturedAlert {
            message: message.to_string(),
            level: Some(level),
            context: context.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;

    #[test]
    fn test_recording_sink_captures_both_kinds() {
        let sink = RecordingErrorSink::new();
        sink.capture_message("store degraded", AlertLevel::Error, &json!({"failures": 5}));
        sink.capture_exception(&Error::Persistence("disk full".into()), &json!({}));

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].level, Some(AlertLevel::Error));
        assert_eq!(alerts[0].context["failures"], 5);
        assert!(alerts[1].level.is_none());
        assert_eq!(sink.count_matching("disk full"), 1);
    }
}
