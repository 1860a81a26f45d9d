//! Event bus routing build events to topic subscribers.
//!
//! Delivery is at-most-once and best-effort: a subscriber only sees events
//! published while it is subscribed, and `publish` never waits on anyone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use super::build::{CiBuildEvent, Topic};

/// Sender for event delivery
pub type EventSender = mpsc::UnboundedSender<CiBuildEvent>;
/// Receiver for event delivery
pub type EventReceiver = mpsc::UnboundedReceiver<CiBuildEvent>;

/// Handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: Topic,
}

/// A live subscription: its handle and the stream of events.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub receiver: EventReceiver,
}

#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<Topic, HashMap<u64, EventSender>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. Only events published from now on are delivered.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics.entry(topic).or_default().insert(id, tx);

        tracing::debug!(subscription = id, ?topic, "Subscribed");
        Subscription {
            handle: SubscriptionHandle { id, topic },
            receiver: rx,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(&handle.topic) {
            subs.remove(&handle.id);
            if subs.is_empty() {
                topics.remove(&handle.topic);
            }
        }
        tracing::debug!(subscription = handle.id, topic = ?handle.topic, "Unsubscribed");
    }

    /// Publish an event to every current subscriber of `topic`.
    ///
    /// Never blocks and never fails; subscribers whose receiver is gone
    /// are dropped.
    pub fn publish(&self, topic: Topic, event: CiBuildEvent) {
        let mut closed = Vec::new();
        {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            let Some(subs) = topics.get(&topic) else {
                return;
            };
            tracing::debug!(
                event = event.name(),
                build_id = %event.build_id(),
                status = ?event.status(),
                subscribers = subs.len(),
                "Publishing"
            );
            for (id, tx) in subs {
                if tx.send(event.clone()).is_err() {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
            if let Some(subs) = topics.get_mut(&topic) {
                for id in &closed {
                    subs.remove(id);
                }
                if subs.is_empty() {
                    topics.remove(&topic);
                }
            }
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&topic)
            .map_or(0, HashMap::len)
    }
}
