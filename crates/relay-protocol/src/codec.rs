//! JSON body codec.
//!
//! Every message produced by Relay carries a JSON body. Other formats need
//! their own envelope constructor on top of [`Publishing::new`](crate::Publishing::new).

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Content type stamped on JSON envelopes.
pub const JSON_CONTENT_TYPE: &str = "text/json";

/// Content encoding stamped on JSON envelopes.
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";

/// Errors raised while encoding or decoding message data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Data had an unexpected shape.
    #[error("Invalid message data: {0}")]
    Invalid(String),
}

/// Encode a value as a JSON body.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(value)?;
    Ok(Bytes::from(body))
}

/// Decode a JSON body.
///
/// # Errors
///
/// Returns an error if the data is not valid JSON for `T`.
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let value = serde_json::from_slice(data)?;
    Ok(value)
}
