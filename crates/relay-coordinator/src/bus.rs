//! Notification fan-out to connected sessions.
//!
//! Delivery is best-effort: each subscriber has a bounded mailbox and a
//! full mailbox drops the event. Nothing is persisted or retried.

use crate::observability::metrics::record_notification_dropped;
use crate::types::{ConsumerId, MediaKind, ProducerId, SessionId};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Server-initiated event pushed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A producer became available for consumption.
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// The session's consumer was closed along with its producer.
    ProducerClosed {
        producer_id: ProducerId,
        consumer_id: ConsumerId,
    },
}

impl Notification {
    /// Wire method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Notification::NewProducer { .. } => "newProducer",
            Notification::ProducerClosed { .. } => "producerClosed",
        }
    }

    /// Wire payload.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Notification::NewProducer { producer_id, kind } => json!({
                "producerId": producer_id,
                "kind": kind,
            }),
            Notification::ProducerClosed {
                producer_id,
                consumer_id,
            } => json!({
                "producerId": producer_id,
                "consumerId": consumer_id,
            }),
        }
    }
}

/// Publish/subscribe registry keyed by session id.
#[derive(Debug, Default)]
pub struct NotificationBus {
    subscribers: RwLock<HashMap<SessionId, mpsc::Sender<Notification>>>,
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's notification mailbox. Replaces any previous one.
    pub async fn subscribe(&self, session_id: SessionId, sender: mpsc::Sender<Notification>) {
        self.subscribers.write().await.insert(session_id, sender);
        debug!(target: "rc.bus", session_id = %session_id, "Session subscribed");
    }

    /// Remove a session. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, session_id: SessionId) -> bool {
        let removed = self.subscribers.write().await.remove(&session_id).is_some();
        if removed {
            debug!(target: "rc.bus", session_id = %session_id, "Session unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every subscriber except `exclude`.
    ///
    /// Returns the number of sessions the event was delivered to.
    pub async fn publish(&self, event: Notification, exclude: Option<SessionId>) -> usize {
        let subscribers = self.subscribers.read().await;
        let mut delivered = 0;
        for (session_id, sender) in subscribers.iter() {
            if Some(*session_id) == exclude {
                continue;
            }
            if deliver(*session_id, sender, event.clone()) {
                delivered += 1;
            }
        }

        debug!(
            target: "rc.bus",
            method = event.method(),
            delivered = delivered,
            "Notification published"
        );
        delivered
    }

    /// Deliver `event` to a single session.
    pub async fn send_to(&self, session_id: SessionId, event: Notification) -> bool {
        let subscribers = self.subscribers.read().await;
        match subscribers.get(&session_id) {
            Some(sender) => deliver(session_id, sender, event),
            None => false,
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

fn deliver(session_id: SessionId, sender: &mpsc::Sender<Notification>, event: Notification) -> bool {
    let method = event.method();
    match sender.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                target: "rc.bus",
                session_id = %session_id,
                method = method,
                "Subscriber mailbox full, notification dropped"
            );
            record_notification_dropped(method);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(
                target: "rc.bus",
                session_id = %session_id,
                method = method,
                "Subscriber gone, notification dropped"
            );
            record_notification_dropped(method);
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn new_producer(id: &str) -> Notification {
        Notification::NewProducer {
            producer_id: ProducerId(id.to_string()),
            kind: MediaKind::Video,
        }
    }

    #[test]
    fn test_notification_wire_payloads() {
        let event = new_producer("p1");
        assert_eq!(event.method(), "newProducer");
        assert_eq!(event.data(), json!({"producerId": "p1", "kind": "video"}));

        let event = Notification::ProducerClosed {
            producer_id: ProducerId("p1".to_string()),
            consumer_id: ConsumerId("c1".to_string()),
        };
        assert_eq!(event.method(), "producerClosed");
        assert_eq!(event.data(), json!({"producerId": "p1", "consumerId": "c1"}));
    }

    #[tokio::test]
    async fn test_publish_excludes_origin() {
        let bus = NotificationBus::new();
        let origin = SessionId::new();
        let other = SessionId::new();

        let (origin_tx, mut origin_rx) = mpsc::channel(4);
        let (other_tx, mut other_rx) = mpsc::channel(4);
        bus.subscribe(origin, origin_tx).await;
        bus.subscribe(other, other_tx).await;

        let delivered = bus.publish(new_producer("p1"), Some(origin)).await;
        assert_eq!(delivered, 1);

        assert_eq!(other_rx.recv().await.unwrap(), new_producer("p1"));
        assert!(other_rx.try_recv().is_err(), "Exactly one delivery");
        assert!(origin_rx.try_recv().is_err(), "Origin is excluded");
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_without_blocking() {
        let bus = NotificationBus::new();
        let session = SessionId::new();
        let (tx, mut rx) = mpsc::channel(1);
        bus.subscribe(session, tx).await;

        assert_eq!(bus.publish(new_producer("p1"), None).await, 1);
        assert_eq!(bus.publish(new_producer("p2"), None).await, 0);

        assert_eq!(rx.recv().await.unwrap(), new_producer("p1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_and_unsubscribe() {
        let bus = NotificationBus::new();
        let session = SessionId::new();
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe(session, tx).await;
        assert_eq!(bus.subscriber_count().await, 1);

        assert!(bus.send_to(session, new_producer("p1")).await);
        assert_eq!(rx.recv().await.unwrap(), new_producer("p1"));

        assert!(bus.unsubscribe(session).await);
        assert!(!bus.unsubscribe(session).await);
        assert!(!bus.send_to(session, new_producer("p2")).await);
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_as_dropped() {
        let bus = NotificationBus::new();
        let (tx, rx) = mpsc::channel(4);
        bus.subscribe(SessionId::new(), tx).await;
        drop(rx);

        assert_eq!(bus.publish(new_producer("p1"), None).await, 0);
    }
}
