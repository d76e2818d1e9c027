use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::traits::{
    BusConsumer, BusError, Delivery, Disposition, Publisher, Subscriber,
};

/// Pause before a nacked message becomes visible again, so a consistently
/// failing handler does not spin on one message.
const REDELIVERY_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone)]
struct Message {
    key: String,
    payload: Vec<u8>,
}

struct Topic {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl Topic {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, message: Message) {
        self.messages
            .lock()
            .expect("topic lock poisoned")
            .push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: Message) {
        self.messages
            .lock()
            .expect("topic lock poisoned")
            .push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        self.messages.lock().expect("topic lock poisoned").pop_front()
    }
}

/// In-process topic bus with queue-per-topic semantics.
///
/// All subscribers of a topic act as one consumer group: each message goes
/// to exactly one of them, and a nacked or dropped delivery is requeued at
/// the front. Matches the at-least-once contract the engine assumes from a
/// real broker.
pub struct InMemoryBus {
    topics: DashMap<String, Arc<Topic>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new()))
            .clone()
    }

    /// Stops delivery: pending `next` calls return `None` once their topic
    /// is drained, and publishing fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.topics.iter() {
            entry.notify.notify_waiters();
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.topic(topic).push_back(Message {
            key: key.to_string(),
            payload,
        });
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn BusConsumer>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        debug!(topic, group, "Subscribed in-memory consumer");
        Ok(Box::new(MemoryConsumer {
            topic: self.topic(topic),
            closed: self.closed.clone(),
        }))
    }
}

/// One group member over an in-memory topic.
pub struct MemoryConsumer {
    topic: Arc<Topic>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(message) = self.topic.pop() {
                let (responder, disposition) = oneshot::channel();
                let topic = self.topic.clone();
                let requeued = message.clone();
                tokio::spawn(async move {
                    match disposition.await {
                        Ok(Disposition::Ack) => {}
                        // nack or dropped handler: make it visible again
                        Ok(Disposition::Nack) | Err(_) => {
                            tokio::time::sleep(REDELIVERY_DELAY).await;
                            topic.push_front(requeued);
                        }
                    }
                });
                return Some(Delivery::new(message.key, message.payload, responder));
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.topic.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn acked_messages_are_not_redelivered() {
        let bus = InMemoryBus::new();
        bus.publish("t", "k1", b"one".to_vec()).await.unwrap();
        let mut consumer = bus.subscribe("t", "g").await.unwrap();
        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.payload, b"one");
        delivery.ack();

        bus.close();
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nacked_messages_come_back() {
        let bus = InMemoryBus::new();
        bus.publish("t", "k1", b"one".to_vec()).await.unwrap();
        let mut consumer = bus.subscribe("t", "g").await.unwrap();

        let delivery = consumer.next().await.unwrap();
        delivery.nack();

        let redelivered = consumer.next().await.unwrap();
        assert_eq!(redelivered.payload, b"one");
        redelivered.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_delivery_counts_as_nack() {
        let bus = InMemoryBus::new();
        bus.publish("t", "k1", b"one".to_vec()).await.unwrap();
        let mut consumer = bus.subscribe("t", "g").await.unwrap();

        drop(consumer.next().await.unwrap());

        let redelivered = consumer.next().await.unwrap();
        assert_eq!(redelivered.payload, b"one");
        redelivered.ack();
    }

    #[tokio::test]
    async fn group_members_share_load() {
        let bus = Arc::new(InMemoryBus::new());
        for i in 0..20 {
            bus.publish("t", &format!("k{i}"), vec![i]).await.unwrap();
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let bus = bus.clone();
            let seen = seen.clone();
            handles.push(tokio::spawn(async move {
                let mut consumer = bus.subscribe("t", "g").await.unwrap();
                while let Some(delivery) = consumer.next().await {
                    seen.fetch_add(1, Ordering::SeqCst);
                    delivery.ack();
                }
            }));
        }

        // let the workers drain the topic, then shut down
        tokio::time::sleep(Duration::from_millis(200)).await;
        bus.close();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let bus = InMemoryBus::new();
        bus.close();
        assert!(matches!(
            bus.publish("t", "k", Vec::new()).await,
            Err(BusError::Closed)
        ));
    }
}
