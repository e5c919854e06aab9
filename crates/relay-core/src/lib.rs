//! # relay-core
//!
//! Routing and acknowledgment core for Relay consumers.
//!
//! This crate sits between a broker-delivered message and business handlers:
//!
//! - **Delivery** - An inbound message bound to exactly one ack/nack outcome
//! - **Consumer** - The single-operation capability every stage implements
//! - **Middleware** - `Consumer -> Consumer` decorators (panic recovery,
//!   trace propagation, logging)
//! - **Router** - Dispatch by routing key and ack/nack resolution
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────┐    ┌──────────┐
//! │ Delivery │───▶│  Middleware  │───▶│  Router  │───▶│ Handler  │
//! └──────────┘    └──────────────┘    └──────────┘    └──────────┘
//!                                          │
//!                                          ▼
//!                                    ack / nack / requeue
//! ```

pub mod consumer;
pub mod delivery;
pub mod error;
pub mod middleware;
pub mod router;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use consumer::{combine, consumer_fn, middleware_fn, Consumer, ConsumerFn, Middleware};
pub use delivery::{AckError, Acknowledger, Delivery};
pub use error::{BoxError, DispatchError, DispatchErrorKind};
pub use router::{ErrorHandler, Handler, Router, RouterStats};
pub use telemetry::{SpanGuard, Telemetry};

/// Context threaded through every consumer call.
pub use opentelemetry::Context;
