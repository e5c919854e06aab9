//! # relay-protocol
//!
//! Message shapes shared by the publishing and consuming sides of Relay.
//!
//! This crate defines what travels over the broker, independent of any
//! particular client library:
//!
//! - `Publishing` - The outbound envelope handed to a broker client
//! - `Headers` - String-keyed header table carried by every message
//! - Trace carrier - The `opentracing_data` header holding trace context
//! - Naming - Exchange and queue naming conventions
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Publishing};
//!
//! // Build a JSON envelope with a fresh message id
//! let msg = Publishing::json(&"hello").unwrap();
//! assert_eq!(msg.content_type, "text/json");
//!
//! let body: String = codec::decode_json(&msg.body).unwrap();
//! assert_eq!(body, "hello");
//! ```

pub mod codec;
pub mod envelope;
pub mod headers;
pub mod naming;

pub use codec::{ProtocolError, JSON_CONTENT_TYPE, UTF8_CONTENT_ENCODING};
pub use envelope::{DeliveryMode, Publishing};
pub use headers::{decode_carrier, encode_carrier, HeaderValue, Headers, TRACE_CARRIER_HEADER};
pub use naming::{exchange_name, queue_name};
