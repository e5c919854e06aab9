//! The outbound message envelope.
//!
//! A [`Publishing`] is everything a broker client needs to send one message.
//! Its headers stay mutable until the envelope is handed to a client, which
//! is where trace context gets injected.

use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::{self, ProtocolError, JSON_CONTENT_TYPE, UTF8_CONTENT_ENCODING};
use crate::headers::{self, HeaderValue, Headers, TRACE_CARRIER_HEADER};

/// Broker persistence mode for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Kept in memory only.
    Transient = 1,
    /// Written to disk by the broker.
    #[default]
    Persistent = 2,
}

impl From<DeliveryMode> for u8 {
    fn from(mode: DeliveryMode) -> u8 {
        mode as u8
    }
}

/// An outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    /// Unique message identifier.
    pub message_id: String,
    /// Header table.
    pub headers: Headers,
    /// MIME content type of the body.
    pub content_type: String,
    /// Content encoding of the body.
    pub content_encoding: String,
    /// Creation time.
    pub timestamp: SystemTime,
    /// Persistence mode.
    pub delivery_mode: DeliveryMode,
    /// Message priority.
    pub priority: u8,
    /// Message body.
    pub body: Bytes,
}

impl Publishing {
    /// Create a JSON envelope around an already-encoded body.
    #[must_use]
    pub fn new(id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: id.into(),
            headers: Headers::new(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            content_encoding: UTF8_CONTENT_ENCODING.to_string(),
            timestamp: SystemTime::now(),
            delivery_mode: DeliveryMode::Persistent,
            priority: 0,
            body: body.into(),
        }
    }

    /// Serialize `payload` to JSON and wrap it with a fresh message id.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<Self, ProtocolError> {
        let body = codec::encode_json(payload)?;
        Ok(Self::new(uuid::Uuid::new_v4().to_string(), body))
    }

    /// Set a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Store a trace carrier under [`TRACE_CARRIER_HEADER`].
    ///
    /// # Errors
    ///
    /// Returns an error if the carrier cannot be serialized.
    pub fn set_trace_carrier(
        &mut self,
        carrier: &HashMap<String, String>,
    ) -> Result<(), ProtocolError> {
        let value = headers::encode_carrier(carrier)?;
        self.headers.insert(TRACE_CARRIER_HEADER.to_string(), value);
        Ok(())
    }

    /// Read back the trace carrier, if any.
    #[must_use]
    pub fn trace_carrier(&self) -> Option<HashMap<String, String>> {
        headers::decode_carrier(&self.headers)
    }
}
