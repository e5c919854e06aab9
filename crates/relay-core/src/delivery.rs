//! Inbound deliveries and their acknowledgment.
//!
//! A [`Delivery`] is a cheap clonable handle. All clones share one
//! settlement flag, so across the whole pipeline only the first `ack` or
//! `nack` reaches the transport; later calls fail with
//! [`AckError::AlreadySettled`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{Headers, Publishing};
use thiserror::Error;

/// Acknowledgment errors.
#[derive(Debug, Error)]
pub enum AckError {
    /// The delivery was already acked or nacked.
    #[error("Delivery {0} already settled")]
    AlreadySettled(u64),

    /// The channel the delivery arrived on is closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// The transport rejected the acknowledgment.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Transport-side acknowledgment of deliveries.
///
/// Implemented by broker clients. Called at most once per delivery tag
/// through [`Delivery`].
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AckError>;

    /// Negatively acknowledge a delivery, optionally asking for redelivery.
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AckError>;
}

/// A message delivered by the broker.
#[derive(Clone)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used to dispatch the message.
    pub routing_key: String,
    /// Message identifier set by the publisher.
    pub message_id: String,
    /// Header table.
    pub headers: Headers,
    /// Message body.
    pub body: Bytes,
    /// MIME content type of the body.
    pub content_type: String,
    /// Content encoding of the body.
    pub content_encoding: String,
    /// Channel-scoped delivery tag.
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Message priority.
    pub priority: u8,
    acker: Arc<dyn Acknowledger>,
    settled: Arc<AtomicBool>,
}

impl Delivery {
    /// Create an empty delivery acknowledged through `acker`.
    #[must_use]
    pub fn new(delivery_tag: u64, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: String::new(),
            message_id: String::new(),
            headers: Headers::new(),
            body: Bytes::new(),
            content_type: String::new(),
            content_encoding: String::new(),
            delivery_tag,
            redelivered: false,
            priority: 0,
            acker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a delivery from a published envelope.
    #[must_use]
    pub fn from_publishing(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        msg: &Publishing,
        delivery_tag: u64,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message_id: msg.message_id.clone(),
            headers: msg.headers.clone(),
            body: msg.body.clone(),
            content_type: msg.content_type.clone(),
            content_encoding: msg.content_encoding.clone(),
            priority: msg.priority,
            ..Self::new(delivery_tag, acker)
        }
    }

    /// Set the exchange.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the routing key.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Set the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Mark as a redelivery.
    #[must_use]
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Whether `ack` or `nack` was already called on this delivery or a clone.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`AckError::AlreadySettled`] on a second settlement, or the
    /// transport's error.
    pub async fn ack(&self, multiple: bool) -> Result<(), AckError> {
        self.settle()?;
        self.acker.ack(self.delivery_tag, multiple).await
    }

    /// Negatively acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`AckError::AlreadySettled`] on a second settlement, or the
    /// transport's error.
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AckError> {
        self.settle()?;
        self.acker.nack(self.delivery_tag, multiple, requeue).await
    }

    fn settle(&self) -> Result<(), AckError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(AckError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("message_id", &self.message_id)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{AckCall, RecordingAcker};

    #[tokio::test]
    async fn test_ack_forwards_to_transport() {
        let acker = RecordingAcker::new();
        let delivery = Delivery::new(7, acker.clone());

        delivery.ack(false).await.unwrap();
        assert!(delivery.is_settled());
        assert_eq!(acker.calls(), vec![AckCall::Ack { tag: 7, multiple: false }]);
    }

    #[tokio::test]
    async fn test_second_settlement_rejected() {
        let acker = RecordingAcker::new();
        let delivery = Delivery::new(1, acker.clone());
        let clone = delivery.clone();

        delivery.nack(false, true).await.unwrap();
        assert!(matches!(
            clone.ack(false).await,
            Err(AckError::AlreadySettled(1))
        ));
        assert!(matches!(
            clone.nack(false, false).await,
            Err(AckError::AlreadySettled(1))
        ));
        assert_eq!(acker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_ack_still_settles() {
        let acker = RecordingAcker::failing();
        let delivery = Delivery::new(3, acker.clone());

        assert!(matches!(delivery.ack(false).await, Err(AckError::ChannelClosed)));
        assert!(delivery.is_settled());
        assert!(matches!(
            delivery.nack(false, false).await,
            Err(AckError::AlreadySettled(3))
        ));
    }

    #[test]
    fn test_from_publishing() {
        let msg = Publishing::new("msg-1", b"{}".to_vec()).with_priority(4);
        let delivery =
            Delivery::from_publishing("orders", "order.placed", &msg, 9, RecordingAcker::new());

        assert_eq!(delivery.exchange, "orders");
        assert_eq!(delivery.routing_key, "order.placed");
        assert_eq!(delivery.message_id, "msg-1");
        assert_eq!(delivery.content_type, "text/json");
        assert_eq!(delivery.priority, 4);
        assert_eq!(delivery.delivery_tag, 9);
        assert!(!delivery.redelivered);
    }
}
