//! Broker client abstraction.
//!
//! These traits describe the broker connection Relay builds on, keeping the
//! router, pool and publisher independent of the client library.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::Context;
use relay_core::Consumer;
use relay_protocol::Publishing;
use thiserror::Error;

use crate::config::ClientConfig;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not establish the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A mandatory message matched no queue.
    #[error("Unroutable message for exchange {exchange} with routing_key {routing_key}")]
    Unroutable {
        /// Target exchange.
        exchange: String,
        /// Routing key used.
        routing_key: String,
    },

    /// The broker rejected the publish.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Closing the connection failed.
    #[error("Close failed: {0}")]
    CloseFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// What a consumer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Exchange the queue is bound to.
    pub exchange: String,
    /// Queue to consume from.
    pub queue: String,
    /// Routing keys bound to the queue. `#` matches every key.
    pub routing_keys: Vec<String>,
    /// Consumer tag reported to the broker.
    pub consumer_tag: String,
}

impl ConsumerSpec {
    /// Create a spec with no bindings.
    #[must_use]
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            exchange: exchange.into(),
            consumer_tag: format!("{}.consumer", queue),
            queue,
            routing_keys: Vec::new(),
        }
    }

    /// Bind a routing key.
    #[must_use]
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_keys.push(key.into());
        self
    }

    /// Set the consumer tag.
    #[must_use]
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Check if `routing_key` is bound.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        self.routing_keys
            .iter()
            .any(|key| key == "#" || key == routing_key)
    }
}

/// A live broker connection.
///
/// Reconnection and channel management are the implementation's concern.
#[async_trait]
pub trait Client: Send + Sync {
    /// Publish an envelope.
    async fn publish(
        &self,
        cx: &Context,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        msg: Publishing,
    ) -> Result<(), ClientError>;

    /// Start delivering messages matching `spec` to `consumer`.
    async fn consume(
        &self,
        spec: ConsumerSpec,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), ClientError>;

    /// Close the connection.
    ///
    /// In-flight deliveries are not cancelled; acking them afterwards fails
    /// with an error instead of panicking.
    async fn close(&self) -> Result<(), ClientError>;
}

/// Builds clients from configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The client type produced.
    type Client: Client + 'static;

    /// Connect using `config`.
    async fn connect(&self, config: &ClientConfig) -> Result<Self::Client, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_spec_matching() {
        let spec = ConsumerSpec::new("exchange_1", "queue_1")
            .routing_key("event_1")
            .routing_key("event_2");

        assert!(spec.matches("event_1"));
        assert!(spec.matches("event_2"));
        assert!(!spec.matches("event_3"));
        assert_eq!(spec.consumer_tag, "queue_1.consumer");
    }

    #[test]
    fn test_wildcard_binding() {
        let spec = ConsumerSpec::new("exchange_1", "audit").routing_key("#");
        assert!(spec.matches("anything"));
    }
}
