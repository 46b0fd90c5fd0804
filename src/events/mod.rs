//! Event bus boundary.
//!
//! The cache consumes domain events (e.g. `property_updated`) to invalidate
//! entries, and produces advisory broadcasts on [`SYNC_TOPIC`]. The transport
//! itself lives outside this crate; [`EventBus`] is the seam, and
//! [`InProcessBus`] is a synchronous in-process implementation.

mod bus;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use bus::InProcessBus;

/// Topic on which the cache publishes its advisory broadcasts.
pub const SYNC_TOPIC: &str = "cache_sync";

/// A message delivered over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub topic: String,

    /// Identifier of the affected record, if the publisher knows it.
    #[serde(default)]
    pub entity_id: Option<String>,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl DomainEvent {
    pub fn new(topic: impl Into<String>, timestamp: i64) -> Self {
        Self {
            topic: topic.into(),
            entity_id: None,
            payload: serde_json::Value::Null,
            timestamp,
        }
    }

    #[must_use]
    pub fn entity(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Callback invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Publish/subscribe transport.
///
/// Delivery is treated as at-least-once and unordered; handlers must be
/// idempotent.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: &str, handler: EventHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    fn publish(&self, event: DomainEvent);
}

/// Name of the domain event that invalidates entries carrying `tag`.
pub fn update_topic(tag: &str) -> String {
    format!("{tag}_updated")
}
