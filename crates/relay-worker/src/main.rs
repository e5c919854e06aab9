//! # Relay Worker
//!
//! Example worker wiring the Relay router to a broker client.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with a config file in the working directory
//! cp relay.example.toml relay.toml && relay
//!
//! # Override settings with environment variables
//! RELAY__BROKER__HOST=rabbit RELAY__CONSUMER__REQUEUE_ON_ERROR=true relay
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,relay_core=debug,relay_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        broker = %config.broker.identity(),
        queue = %config.consumer.queue_name(),
        "Starting Relay worker"
    );

    // Initialize metrics
    metrics::init_metrics();

    handlers::run_worker(config).await?;

    Ok(())
}
