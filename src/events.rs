//! Resource change events.
//!
//! Every committed store mutation emits one [`ResourceEvent`], in commit
//! order per collection. Delivery (webhooks, logs) is up to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// A committed change to one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEvent {
    pub schema: String,
    pub id: String,
    pub operation: ChangeKind,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

impl ResourceEvent {
    pub fn new(schema: &str, id: &str, operation: ChangeKind, revision: u64) -> Self {
        Self {
            schema: schema.to_string(),
            id: id.to_string(),
            operation,
            revision,
            timestamp: Utc::now(),
        }
    }

    /// Event name in `<collection>.<change>` form, e.g. `user.created`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.schema.to_lowercase(), self.operation.as_str())
    }
}

/// Receives events as mutations commit. Called while the collection lock is
/// held, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ResourceEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ResourceEvent) {}
}

/// Fan-out over a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResourceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: ResourceEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
