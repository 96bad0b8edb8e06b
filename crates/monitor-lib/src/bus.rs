//! In-process publish/subscribe backbone
//!
//! Single tagged-union broadcast channel; every subscriber gets its own
//! ordered copy of each event. Payloads are immutable snapshots, with the
//! large ones behind `Arc` so fan-out stays cheap.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::models::{AlertHistoryEntry, ContainerLifecycle, HealthChange, MetricsSnapshot};
use crate::observability::AgentMetrics;

/// Wire names for each event kind, shared by the bus and the realtime
/// gateway envelopes
pub mod kinds {
    pub const CONTAINER_EVENT: &str = "container:event";
    pub const METRICS_SNAPSHOT: &str = "metrics:snapshot";
    pub const HEALTH_CHANGE: &str = "health:change";
    pub const ALERT_FIRED: &str = "alert:fired";
    pub const ALERT_RESOLVED: &str = "alert:resolved";
}

/// A pipeline event
#[derive(Debug, Clone)]
pub enum Event {
    Container(ContainerLifecycle),
    Metrics(Arc<MetricsSnapshot>),
    Health(HealthChange),
    AlertFired(Arc<AlertHistoryEntry>),
    AlertResolved(Arc<AlertHistoryEntry>),
}

impl Event {
    /// Wire name of this event kind
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Container(_) => kinds::CONTAINER_EVENT,
            Event::Metrics(_) => kinds::METRICS_SNAPSHOT,
            Event::Health(_) => kinds::HEALTH_CHANGE,
            Event::AlertFired(_) => kinds::ALERT_FIRED,
            Event::AlertResolved(_) => kinds::ALERT_RESOLVED,
        }
    }

    /// Payload as JSON, for envelope-wrapping on the realtime channel
    pub fn payload(&self) -> serde_json::Value {
        let result = match self {
            Event::Container(ev) => serde_json::to_value(ev),
            Event::Metrics(snapshot) => serde_json::to_value(snapshot.as_ref()),
            Event::Health(change) => serde_json::to_value(change),
            Event::AlertFired(entry) => serde_json::to_value(entry.as_ref()),
            Event::AlertResolved(entry) => serde_json::to_value(entry.as_ref()),
        };
        result.unwrap_or_default()
    }
}

/// Broadcast bus with per-subscriber FIFO ordering
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is simply dropped, and a subscriber that falls behind loses the oldest
/// events for itself only (it observes `Lagged` on its receiver).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    metrics: AgentMetrics,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            metrics: AgentMetrics::new(),
        }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: Event) {
        self.metrics.inc_event_published(event.kind());
        // Err means zero receivers, which is fine
        let _ = self.tx.send(event);
    }

    /// Open a new subscription starting at the current position
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        // Enough headroom for a slow subscriber to survive several cycles
        Self::new(256)
    }
}
