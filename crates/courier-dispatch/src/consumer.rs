use std::sync::Arc;

use courier_bus::{BusConsumer, Delivery, DynSubscriber};
use courier_core::NotificationRequest;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatcher::BatchingDispatcher;
use crate::error::DispatchError;

/// Bus-side ingress: consumes the notifications topic and feeds the
/// dispatcher.
///
/// Ack policy: a message is acked once its records are persisted (delivery
/// failures retry internally), and also on anything a redelivery cannot fix
/// — malformed payloads, validation failures, permanent errors. Only
/// transient pre-persistence failures nack for redelivery.
pub struct ConsumerWorker {
    subscriber: DynSubscriber,
    dispatcher: Arc<BatchingDispatcher>,
    topic: String,
    group: String,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerWorker {
    pub fn new(
        subscriber: DynSubscriber,
        dispatcher: Arc<BatchingDispatcher>,
        topic: impl Into<String>,
        group: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            subscriber,
            dispatcher,
            topic: topic.into(),
            group: group.into(),
            shutdown,
        }
    }

    /// Runs until shutdown or until the bus closes. Several workers may run
    /// with the same group to share load.
    pub async fn run(mut self) -> Result<(), DispatchError> {
        let mut consumer = self.subscriber.subscribe(&self.topic, &self.group).await?;
        info!(topic = %self.topic, group = %self.group, "Notification consumer started");

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(delivery) => self.handle(delivery).await,
                        None => break,
                    }
                }
            }
        }

        info!(topic = %self.topic, "Notification consumer stopped");
        Ok(())
    }

    async fn handle(&self, delivery: Delivery) {
        let request: NotificationRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(key = %delivery.key, error = %err, "Poison message, dropping");
                delivery.ack();
                return;
            }
        };

        if let Err(err) = request.validate() {
            warn!(key = %delivery.key, error = %err, "Invalid notification request, dropping");
            delivery.ack();
            return;
        }

        match self.dispatcher.process(request).await {
            Ok(()) => {
                debug!(key = %delivery.key, "Message processed");
                delivery.ack();
            }
            Err(err) if err.is_transient() => {
                warn!(key = %delivery.key, error = %err, "Processing failed, message will be redelivered");
                delivery.nack();
            }
            Err(err) => {
                warn!(key = %delivery.key, error = %err, "Processing failed permanently");
                delivery.ack();
            }
        }
    }
}
