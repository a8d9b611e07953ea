//! Inbound cloud event bus feeding the correlation engine.
//!
//! Every subscriber owns an unbounded FIFO queue and a cancellation scope.
//! `publish` hands the event to every live subscriber before returning, so an
//! ingestion layer may acknowledge the source message once it returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use synapse_types::event::CloudEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Subscriber {
    sender: mpsc::UnboundedSender<Arc<CloudEvent>>,
    cancel: CancellationToken,
}

/// Multi-subscriber, unbounded, ordered event stream.
#[derive(Clone)]
pub struct CloudEventBus {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: Arc<AtomicU64>,
}

impl CloudEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a subscriber that receives every event published afterwards.
    pub fn subscribe(&self) -> CloudEventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.subscribers.insert(
            id,
            Subscriber {
                sender,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(subscriber = id, "cloud event subscriber registered");
        CloudEventSubscription {
            id,
            receiver,
            cancel,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Hand `event` to every live subscriber. Returns the number reached.
    pub fn publish(&self, event: CloudEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        self.subscribers.retain(|id, sub| {
            if sub.cancel.is_cancelled() {
                return false;
            }
            match sub.sender.send(Arc::clone(&event)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::debug!(subscriber = *id, "dropping closed cloud event subscriber");
                    false
                }
            }
        });
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, delivered, "published cloud event");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for CloudEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CloudEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudEventBus")
            .field("subscriber_count", &self.subscribers.len())
            .finish()
    }
}

/// One subscriber's queue. Dropping it unsubscribes.
pub struct CloudEventSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Arc<CloudEvent>>,
    cancel: CancellationToken,
    subscribers: Arc<DashMap<u64, Subscriber>>,
}

impl CloudEventSubscription {
    /// Next event in publish order; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<CloudEvent>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }

    /// Token cancelled when the subscription ends.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop receiving. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.subscribers.remove(&self.id);
            tracing::debug!(subscriber = self.id, "cloud event subscriber removed");
        }
    }
}

impl Drop for CloudEventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> CloudEvent {
        CloudEvent::new(id, "/tests", "com.example.test")
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = CloudEventBus::new();
        let mut sub = bus.subscribe();

        for i in 0..5 {
            assert_eq!(bus.publish(event(&format!("e{i}"))), 1);
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await.unwrap().id, format!("e{i}"));
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let bus = CloudEventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(event("e1")), 2);
        assert_eq!(a.recv().await.unwrap().id, "e1");
        assert_eq!(b.recv().await.unwrap().id, "e1");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = CloudEventBus::new();
        let mut sub = bus.subscribe();
        sub.unsubscribe();
        sub.unsubscribe();

        assert_eq!(bus.publish(event("e1")), 0);
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let bus = CloudEventBus::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(event("e1")), 0);
    }
}
