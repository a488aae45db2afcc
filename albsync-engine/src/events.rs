//! Event reporting for reconciliation.
//!
//! Reconcilers report every cloud mutation and every failed cloud call
//! through an [`EventRecorder`]. The controller decides where events go.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Sink for reconciliation events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, kind: EventType, reason: &str, message: &str);
}

impl<F> EventRecorder for F
where
    F: Fn(EventType, &str, &str) + Send + Sync,
{
    fn record(&self, kind: EventType, reason: &str, message: &str) {
        self(kind, reason, message)
    }
}

/// Shared event callback handed down the reconcile cascade.
pub type Events = Arc<dyn EventRecorder>;

/// Forwards events to the tracing subscriber.
pub struct TracingRecorder {
    object: String,
}

impl TracingRecorder {
    /// `object` names the routing resource events are reported for.
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
        }
    }
}

impl EventRecorder for TracingRecorder {
    fn record(&self, kind: EventType, reason: &str, message: &str) {
        match kind {
            EventType::Normal => info!(object = %self.object, reason, "{}", message),
            EventType::Warning => warn!(object = %self.object, reason, "{}", message),
        }
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory for later inspection.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reasons of all recorded events, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, kind: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                kind,
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}
