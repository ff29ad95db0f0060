//! Local publish/subscribe for server-pushed envelopes and the internal
//! `service-ready` event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::messages::InboundEnvelope;

/// Raised locally once the connection is open and bootstrap has started.
pub const SERVICE_READY: &str = "service-ready";

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes lazily.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::UnboundedReceiver<InboundEnvelope>,
}

impl Subscription {
    /// Wait for the next envelope published on this topic.
    pub async fn recv(&mut self) -> Option<InboundEnvelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundEnvelope> {
        self.rx.try_recv().ok()
    }
}

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<InboundEnvelope>,
}

/// Topic → listener list. Publishing to a topic nobody listens on is fine.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Listener { id, tx });
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut topics = self.topics.lock();
        let Some(listeners) = topics.get_mut(&subscription.topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| l.id != subscription.id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            topics.remove(&subscription.topic);
        }
        removed
    }

    /// Deliver `envelope` to every live listener of `topic`; returns how many got it.
    pub fn publish(&self, topic: &str, envelope: &InboundEnvelope) -> usize {
        let mut topics = self.topics.lock();
        let Some(listeners) = topics.get_mut(topic) else {
            tracing::debug!(topic, "no subscribers");
            return 0;
        };
        listeners.retain(|l| l.tx.send(envelope.clone()).is_ok());
        let delivered = listeners.len();
        if listeners.is_empty() {
            topics.remove(topic);
        }
        tracing::debug!(topic, delivered, "published event");
        delivered
    }
}
