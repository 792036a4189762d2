use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::dto::sse::ServerEvent;

/// Topic carrying every event of one session.
pub fn session_topic(session_id: Uuid) -> String {
    format!("session::{session_id}")
}

/// Publish/subscribe fan-out used by the coordinator.
///
/// Delivery is ordered per topic and best-effort: subscribers that lag skip events
/// and are expected to resync through a snapshot.
pub trait MessageChannel: Send + Sync {
    /// Deliver `event` to every current subscriber of `topic`.
    fn publish(&self, topic: &str, event: ServerEvent);
    /// Receive events published to `topic` from now on.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<ServerEvent>;
}

/// In-process [`MessageChannel`]: one broadcast sender per topic, created on first
/// subscription and dropped once its last subscriber leaves.
pub struct TopicHub {
    topics: DashMap<String, broadcast::Sender<ServerEvent>>,
    capacity: usize,
}

impl TopicHub {
    /// Hub whose topics buffer `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    /// Number of topics with at least one live sender.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl MessageChannel for TopicHub {
    fn publish(&self, topic: &str, event: ServerEvent) {
        let Some(sender) = self.topics.get(topic).map(|entry| entry.clone()) else {
            return;
        };
        if sender.send(event).is_err() {
            self.topics
                .remove_if(topic, |_, sender| sender.receiver_count() == 0);
        }
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<ServerEvent> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> ServerEvent {
        ServerEvent::new(Some(name.into()), "{}".into())
    }

    #[tokio::test]
    async fn events_reach_only_their_topic_in_order() {
        let hub = TopicHub::new(8);
        let first = session_topic(Uuid::new_v4());
        let second = session_topic(Uuid::new_v4());
        let mut rx_first = hub.subscribe(&first);
        let mut rx_second = hub.subscribe(&second);

        hub.publish(&first, event("one"));
        hub.publish(&first, event("two"));
        hub.publish(&second, event("other"));

        assert!(rx_first.recv().await.unwrap().is("one"));
        assert!(rx_first.recv().await.unwrap().is("two"));
        assert!(rx_second.recv().await.unwrap().is("other"));
        assert!(rx_first.try_recv().is_err());
    }

    #[tokio::test]
    async fn abandoned_topics_are_dropped() {
        let hub = TopicHub::new(8);
        let topic = session_topic(Uuid::new_v4());
        let rx = hub.subscribe(&topic);
        assert_eq!(hub.topic_count(), 1);

        drop(rx);
        hub.publish(&topic, event("nobody"));
        assert_eq!(hub.topic_count(), 0);

        // Publishing to an unknown topic is a no-op.
        hub.publish(&topic, event("nobody"));
        assert_eq!(hub.topic_count(), 0);
    }
}
