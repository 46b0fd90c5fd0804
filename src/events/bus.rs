//! In-process publish/subscribe bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use super::{DomainEvent, EventBus, EventHandler, SubscriptionId};

/// Synchronous, in-process event bus.
///
/// Handlers run on the publishing thread. The handler table lock is released
/// before any handler runs, so handlers may subscribe, unsubscribe or publish
/// without deadlocking.
#[derive(Default)]
pub struct InProcessBus {
    topics: RwLock<HashMap<String, Vec<(SubscriptionId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl InProcessBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of handlers registered for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }
}

impl EventBus for InProcessBus {
    fn subscribe(&self, topic: &str, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        debug!("Subscribed {:?} to '{}'", id, topic);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut topics = self.topics.write();
        for handlers in topics.values_mut() {
            handlers.retain(|(sub, _)| *sub != id);
        }
        topics.retain(|_, handlers| !handlers.is_empty());
    }

    fn publish(&self, event: DomainEvent) {
        let handlers: Vec<EventHandler> = match self.topics.read().get(&event.topic) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in handlers {
            handler(&event);
        }
    }
}

impl std::fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.topics.read();
        f.debug_struct("InProcessBus")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .finish()
    }
}
