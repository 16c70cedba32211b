//! Signaling event bus.
//!
//! The registry publishes [`SignalEvent`]s to `user.{id}` and `group.{id}`
//! topics; clients subscribe to the topics they care about. Delivery is
//! at-least-once: consumers must tolerate duplicates and reordering.

use callcore::events::{Envelope, SignalEvent, Topic};
use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;

// The size of the per-topic broadcast buffer.
const CHANNEL_CAPACITY: usize = 100;

pub trait SignalBus: Send + Sync {
    fn publish(&self, topic: Topic, event: SignalEvent);

    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Envelope>;
}

/// Process-local bus with one broadcast channel per topic.
///
/// `set_redelivery(n)` makes every publish go out `n + 1` times, which is how
/// tests exercise the at-least-once contract.
#[derive(Debug, Default)]
pub struct InMemorySignalBus {
    topics: DashMap<Topic, broadcast::Sender<Envelope>>,
    redeliveries: AtomicU32,
}

impl InMemorySignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_redelivery(&self, extra_copies: u32) {
        self.redeliveries.store(extra_copies, Ordering::Relaxed);
    }

    /// Live receivers on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, topic: &Topic) -> broadcast::Sender<Envelope> {
        self.topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl SignalBus for InMemorySignalBus {
    fn publish(&self, topic: Topic, event: SignalEvent) {
        let sender = self.sender(&topic);
        let copies = 1 + self.redeliveries.load(Ordering::Relaxed);
        debug!("publish {} on {} (x{})", event.name(), topic, copies);
        let envelope = Envelope::new(topic, event);
        for _ in 0..copies {
            // No subscribers is not an error: nobody is online for that topic.
            let _ = sender.send(envelope.clone());
        }
    }

    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Envelope> {
        self.sender(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::types::{CallId, UserId};

    #[tokio::test]
    async fn delivers_only_to_matching_topic() {
        let bus = InMemorySignalBus::new();
        let bob = Topic::User(UserId::new("bob"));
        let carol = Topic::User(UserId::new("carol"));
        let mut bob_rx = bus.subscribe(&bob);
        let mut carol_rx = bus.subscribe(&carol);

        bus.publish(
            bob.clone(),
            SignalEvent::CallCancelled {
                call_id: CallId::new("c1"),
            },
        );

        let envelope = bob_rx.recv().await.unwrap();
        assert_eq!(envelope.topic, bob);
        assert_eq!(envelope.event.name(), "call-cancelled");
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn redelivery_duplicates_events() {
        let bus = InMemorySignalBus::new();
        let topic = Topic::User(UserId::new("bob"));
        let mut rx = bus.subscribe(&topic);
        bus.set_redelivery(1);

        bus.publish(
            topic,
            SignalEvent::CallMissed {
                call_id: CallId::new("c1"),
            },
        );
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = InMemorySignalBus::new();
        bus.publish(
            Topic::User(UserId::new("nobody")),
            SignalEvent::CallMissed {
                call_id: CallId::new("c1"),
            },
        );
    }
}
