use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

/// Errors from the bus transport.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

pub type DynPublisher = Arc<dyn Publisher>;
pub type DynSubscriber = Arc<dyn Subscriber>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    Nack,
}

/// One received message plus its acknowledgement handle.
///
/// Exactly one of `ack` / `nack` must be called; dropping an unacknowledged
/// delivery counts as a nack, so a crashed handler leads to redelivery
/// rather than message loss.
pub struct Delivery {
    pub key: String,
    pub payload: Vec<u8>,
    responder: Option<oneshot::Sender<Disposition>>,
}

impl Delivery {
    pub(crate) fn new(key: String, payload: Vec<u8>, responder: oneshot::Sender<Disposition>) -> Self {
        Self {
            key,
            payload,
            responder: Some(responder),
        }
    }

    /// Marks the message as processed; it will not be delivered again.
    pub fn ack(mut self) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(Disposition::Ack);
        }
    }

    /// Returns the message to the topic for redelivery.
    pub fn nack(mut self) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(Disposition::Nack);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        // An abandoned delivery is redelivered, preserving at-least-once.
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(Disposition::Nack);
        }
    }
}

/// Produces messages onto a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// A group member's stream of deliveries from one topic.
#[async_trait]
pub trait BusConsumer: Send {
    /// The next message for this consumer, or `None` once the bus is closed
    /// and drained.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Creates consumers that share a topic's load within a consumer group.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn BusConsumer>, BusError>;
}
