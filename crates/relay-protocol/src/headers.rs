//! Message headers and the trace carrier header.
//!
//! Trace context crosses the publish/consume boundary as a flat
//! string-to-string map, JSON-encoded into a single header value.

use std::collections::{BTreeMap, HashMap};

use crate::codec::ProtocolError;

/// Header key carrying the JSON-encoded trace carrier.
pub const TRACE_CARRIER_HEADER: &str = "opentracing_data";

/// A single header value. Broker field tables hold arbitrary values.
pub type HeaderValue = serde_json::Value;

/// String-keyed header table.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Encode a trace carrier into a header value.
///
/// # Errors
///
/// Returns an error if the carrier cannot be serialized.
pub fn encode_carrier(carrier: &HashMap<String, String>) -> Result<HeaderValue, ProtocolError> {
    let encoded = serde_json::to_string(carrier)?;
    Ok(HeaderValue::String(encoded))
}

/// Decode the trace carrier from a header table.
///
/// Returns `None` if the header is missing, is not a string, or does not
/// hold a JSON object of strings.
#[must_use]
pub fn decode_carrier(headers: &Headers) -> Option<HashMap<String, String>> {
    let raw = headers.get(TRACE_CARRIER_HEADER)?.as_str()?;
    serde_json::from_str(raw).ok()
}
