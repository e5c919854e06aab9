//! Dispatch error taxonomy.
//!
//! None of these errors are returned from `Consumer::consume`; the router
//! reports them to the configured error handler instead.

use thiserror::Error;

use crate::delivery::{AckError, Delivery};

/// Error type returned by business handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures raised while dispatching a delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is registered for the routing key.
    #[error("handler not found for routing_key: {routing_key}")]
    HandlerNotFound {
        /// Routing key of the unroutable delivery.
        routing_key: String,
    },

    /// The business handler returned an error.
    #[error("handler failed for routing_key: {routing_key}: {source}")]
    Handler {
        /// Routing key of the failed delivery.
        routing_key: String,
        /// Error returned by the handler.
        source: BoxError,
    },

    /// The terminal nack was rejected by the transport.
    #[error("NACK failed for routing_key: {routing_key}: {source} (after: {cause})")]
    NackFailed {
        /// Routing key of the delivery.
        routing_key: String,
        /// Transport error.
        source: AckError,
        /// Error that led to the nack.
        cause: Box<DispatchError>,
    },

    /// The terminal ack was rejected by the transport.
    #[error("ACK failed for routing_key: {routing_key}: {source}")]
    AckFailed {
        /// Routing key of the delivery.
        routing_key: String,
        /// Transport error.
        source: AckError,
    },
}

/// Discriminant of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchErrorKind {
    HandlerNotFound,
    Handler,
    NackFailed,
    AckFailed,
}

impl DispatchErrorKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandlerNotFound => "handler_not_found",
            Self::Handler => "handler",
            Self::NackFailed => "nack_failed",
            Self::AckFailed => "ack_failed",
        }
    }
}

impl DispatchError {
    pub(crate) fn handler_not_found(delivery: &Delivery) -> Self {
        Self::HandlerNotFound {
            routing_key: delivery.routing_key.clone(),
        }
    }

    pub(crate) fn handler(delivery: &Delivery, source: BoxError) -> Self {
        Self::Handler {
            routing_key: delivery.routing_key.clone(),
            source,
        }
    }

    pub(crate) fn nack_failed(delivery: &Delivery, source: AckError, cause: DispatchError) -> Self {
        Self::NackFailed {
            routing_key: delivery.routing_key.clone(),
            source,
            cause: Box::new(cause),
        }
    }

    pub(crate) fn ack_failed(delivery: &Delivery, source: AckError) -> Self {
        Self::AckFailed {
            routing_key: delivery.routing_key.clone(),
            source,
        }
    }

    /// The kind of this error.
    #[must_use]
    pub fn kind(&self) -> DispatchErrorKind {
        match self {
            Self::HandlerNotFound { .. } => DispatchErrorKind::HandlerNotFound,
            Self::Handler { .. } => DispatchErrorKind::Handler,
            Self::NackFailed { .. } => DispatchErrorKind::NackFailed,
            Self::AckFailed { .. } => DispatchErrorKind::AckFailed,
        }
    }

    /// Routing key of the delivery the error belongs to.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        match self {
            Self::HandlerNotFound { routing_key }
            | Self::Handler { routing_key, .. }
            | Self::NackFailed { routing_key, .. }
            | Self::AckFailed { routing_key, .. } => routing_key,
        }
    }

    /// For a failed nack, the error that led to it.
    #[must_use]
    pub fn cause(&self) -> Option<&DispatchError> {
        match self {
            Self::NackFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}
