//! # relay-transport
//!
//! Broker-facing side of Relay.
//!
//! This crate defines what Relay needs from a broker client and builds the
//! shared pieces on top of it:
//!
//! - **Client** - Publish, consume and close against one broker connection
//! - **ClientPool** - One live client per connection identity
//! - **Publisher** - JSON envelopes with trace context in their headers
//! - **MemoryBroker** - An in-process loopback client
//!
//! ```rust,ignore
//! use relay_transport::{ClientConfig, ClientPool, MemoryConnector, Publisher};
//!
//! let pool = ClientPool::new(MemoryConnector::default());
//! let client = pool.register(&ClientConfig::default()).await?;
//! Publisher::new(client).publish(&cx, "exchange_1", "event_1", &"hello").await?;
//! ```

pub mod client;
pub mod config;
pub mod memory;
pub mod pool;
pub mod publisher;

pub use client::{Client, ClientError, Connector, ConsumerSpec};
pub use config::ClientConfig;
pub use memory::{MemoryBroker, MemoryConnector, Outcome, PublishedMessage, Settlement};
pub use pool::{ClientPool, PoolError};
pub use publisher::{publish, publish_message, PublishError, Publisher};
