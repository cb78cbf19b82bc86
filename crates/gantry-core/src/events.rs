//! Job lifecycle events, envelope schema, and event bus.
//!
//! Every scheduler emits into one shared [`EventBus`]. Consumers either take a
//! broadcast receiver ([`EventBus::subscribe`]) for async fan-out (WebSocket,
//! SSE) or register a synchronous listener for one event kind
//! ([`EventBus::on`]). Listeners run inline at the emission point, so they
//! observe events of a job in exactly the order the scheduler produced them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Job events
// ============================================================================

/// Lifecycle event emitted by a pipeline scheduler.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"JobStarted","pipeline_id":"repomix","job_id":"j1","attempt":1}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// A job was accepted and queued.
    JobCreated { pipeline_id: String, job_id: String },
    /// A job was dequeued and handed to its handler.
    JobStarted {
        pipeline_id: String,
        job_id: String,
        attempt: u32,
    },
    /// Handler-reported progress.
    JobProgress {
        pipeline_id: String,
        job_id: String,
        percent: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A job completed successfully.
    JobCompleted {
        pipeline_id: String,
        job_id: String,
        duration_ms: u64,
    },
    /// A job failed permanently.
    JobFailed {
        pipeline_id: String,
        job_id: String,
        error: String,
        reason: String,
    },
    /// A job was cancelled.
    JobCancelled { pipeline_id: String, job_id: String },
    /// A failed attempt was scheduled for another try.
    RetryCreated {
        pipeline_id: String,
        job_id: String,
        retry_count: u32,
        delay_ms: u64,
        reason: String,
    },
    /// Retries were exhausted on a retryable failure.
    RetryMaxAttempts {
        pipeline_id: String,
        job_id: String,
        attempts: u32,
    },
}

impl JobEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            JobEvent::JobCreated { .. } => EventKind::JobCreated,
            JobEvent::JobStarted { .. } => EventKind::JobStarted,
            JobEvent::JobProgress { .. } => EventKind::JobProgress,
            JobEvent::JobCompleted { .. } => EventKind::JobCompleted,
            JobEvent::JobFailed { .. } => EventKind::JobFailed,
            JobEvent::JobCancelled { .. } => EventKind::JobCancelled,
            JobEvent::RetryCreated { .. } => EventKind::RetryCreated,
            JobEvent::RetryMaxAttempts { .. } => EventKind::RetryMaxAttempts,
        }
    }

    /// Wire name of the event (e.g. `"job:created"`).
    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn pipeline_id(&self) -> &str {
        match self {
            JobEvent::JobCreated { pipeline_id, .. }
            | JobEvent::JobStarted { pipeline_id, .. }
            | JobEvent::JobProgress { pipeline_id, .. }
            | JobEvent::JobCompleted { pipeline_id, .. }
            | JobEvent::JobFailed { pipeline_id, .. }
            | JobEvent::JobCancelled { pipeline_id, .. }
            | JobEvent::RetryCreated { pipeline_id, .. }
            | JobEvent::RetryMaxAttempts { pipeline_id, .. } => pipeline_id,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::JobCreated { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobProgress { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobCancelled { job_id, .. }
            | JobEvent::RetryCreated { job_id, .. }
            | JobEvent::RetryMaxAttempts { job_id, .. } => job_id,
        }
    }
}

/// Event names usable for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
    RetryCreated,
    RetryMaxAttempts,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobCreated => "job:created",
            EventKind::JobStarted => "job:started",
            EventKind::JobProgress => "job:progress",
            EventKind::JobCompleted => "job:completed",
            EventKind::JobFailed => "job:failed",
            EventKind::JobCancelled => "job:cancelled",
            EventKind::RetryCreated => "retry:created",
            EventKind::RetryMaxAttempts => "retry:max-attempts",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn parse(name: &str) -> Option<Self> {
        [
            EventKind::JobCreated,
            EventKind::JobStarted,
            EventKind::JobProgress,
            EventKind::JobCompleted,
            EventKind::JobFailed,
            EventKind::JobCancelled,
            EventKind::RetryCreated,
            EventKind::RetryMaxAttempts,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Versioned wrapper delivered to every consumer.
///
/// ## Schema Evolution
///
/// - `payload_version` starts at `1` and increments on breaking payload changes.
/// - Consumers should ignore unknown fields.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Wire event name (e.g. `"job:started"`).
    pub event_type: &'static str,
    /// When the event occurred (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: JobEvent,
}

impl EventEnvelope {
    pub fn new(event: JobEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type(),
            occurred_at: Utc::now(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Handle returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    kind: Option<EventKind>,
    listener: Listener,
}

/// Event bus shared by all schedulers of a process.
///
/// Broadcast subscribers that fall behind receive `Lagged` and miss events;
/// named listeners never miss events but must not block.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    listeners: Arc<RwLock<Vec<ListenerEntry>>>,
    next_listener_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Emit an event to listeners and broadcast subscribers.
    pub fn emit(&self, event: JobEvent) {
        let envelope = EventEnvelope::new(event);

        // Snapshot so listeners may (un)register without deadlocking.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.kind.map_or(true, |k| k == envelope.payload.kind()))
            .map(|entry| entry.listener.clone())
            .collect();

        tracing::debug!(
            event_type = envelope.event_type,
            pipeline_id = envelope.payload.pipeline_id(),
            job_id = envelope.payload.job_id(),
            listener_count = listeners.len(),
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );

        for listener in listeners {
            listener(&envelope);
        }
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped events. Each subscriber gets its own stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Register a listener for every event.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Returns the number of active broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ListenerEntry { id, kind, listener });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

// ============================================================================
// Tests
// ============================================================================
