use crate::broker::Broker;
use crate::model::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 256;

type Topics = Arc<Mutex<HashMap<Uuid, broadcast::Sender<Message>>>>;

/// Per-chat topic registry decoupling message producers from live
/// subscribers. Topics are created on first subscribe and garbage-collected
/// when the last subscriber leaves.
///
/// With a broker attached, publishes go through Redis and come back via the
/// forwarder task, so every instance (including this one) observes a single
/// delivery order per chat. Without one, delivery is purely in-process.
#[derive(Clone)]
pub struct BroadcastHub {
    topics: Topics,
    capacity: usize,
    broker: Option<Broker>,
}

impl BroadcastHub {
    /// In-process hub with a bounded per-subscriber buffer.
    pub fn local(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            broker: None,
        }
    }

    /// Broker-backed hub. An unreachable broker degrades to the local-only
    /// hub rather than failing startup.
    pub async fn with_broker(capacity: usize, url: &str) -> Self {
        match Broker::connect(url).await {
            Ok(broker) => {
                let hub = Self {
                    topics: Arc::new(Mutex::new(HashMap::new())),
                    capacity,
                    broker: Some(broker.clone()),
                };
                broker.spawn_forwarder(hub.clone());
                tracing::info!(url, "broadcast hub connected to broker");
                hub
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "broker unreachable, falling back to local-only delivery");
                Self::local(capacity)
            }
        }
    }

    /// Deliver a message to every live subscriber of its chat. Best-effort:
    /// no subscribers is a no-op, and a slow subscriber never stalls the
    /// publisher. A failed broker publish degrades to local delivery.
    pub async fn publish(&self, message: Message) {
        if let Some(broker) = &self.broker {
            match broker.publish(&message).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(chat_id = %message.chat_id, error = %e, "broker publish failed, delivering locally");
                }
            }
        }
        self.deliver_local(message);
    }

    /// Fan a message out to the local topic, if anyone is listening.
    pub(crate) fn deliver_local(&self, message: Message) {
        let chat_id = message.chat_id;
        let sender = { self.topics.lock().get(&chat_id).cloned() };
        let Some(sender) = sender else { return };
        if sender.send(message).is_err() {
            // every receiver disappeared since the topic was created
            let mut topics = self.topics.lock();
            if topics.get(&chat_id).map(|s| s.receiver_count()) == Some(0) {
                topics.remove(&chat_id);
            }
        }
    }

    /// Register a live listener for a chat. The returned handle yields newly
    /// published messages only; history is never replayed.
    pub fn subscribe(&self, chat_id: Uuid) -> Subscription {
        let rx = {
            let mut topics = self.topics.lock();
            topics
                .entry(chat_id)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        Subscription {
            chat_id,
            rx,
            topics: self.topics.clone(),
        }
    }

    pub fn subscriber_count(&self, chat_id: &Uuid) -> usize {
        self.topics
            .lock()
            .get(chat_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// A live subscription to one chat's topic. Dropping the handle
/// deregisters it.
pub struct Subscription {
    chat_id: Uuid,
    rx: broadcast::Receiver<Message>,
    topics: Topics,
}

impl Subscription {
    pub fn chat_id(&self) -> Uuid {
        self.chat_id
    }

    /// Next message published to this chat, in publish order. Returns `None`
    /// once the topic is gone. A subscriber that falls behind its buffer
    /// loses the oldest undelivered notifications (durable history remains
    /// authoritative) and keeps receiving from there.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(chat_id = %self.chat_id, skipped, "subscriber lagged, dropped oldest live notifications");
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = self.topics.lock();
        if let Some(sender) = topics.get(&self.chat_id) {
            // our receiver still counts until this handle is fully dropped
            if sender.receiver_count() <= 1 {
                topics.remove(&self.chat_id);
            }
        }
    }
}
