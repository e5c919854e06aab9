//! Worker configuration.
//!
//! Configuration is layered:
//! - Defaults
//! - TOML configuration file (first found of `relay.toml`,
//!   `/etc/relay/relay.toml`, `~/.config/relay/relay.toml`)
//! - Environment variables (`RELAY__SECTION__KEY`)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use relay_transport::ClientConfig;
use serde::{Deserialize, Serialize};

const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection.
    #[serde(default)]
    pub broker: ClientConfig,

    /// What to consume.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Demo publishing.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Application name, prefixed to exchange and queue names.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Deployment environment, part of the queue name.
    #[serde(default = "default_env")]
    pub env: String,

    /// Exchange name without the application prefix.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Queue name without the application and environment prefix.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Routing keys bound to the queue, each with the demo handler.
    #[serde(default = "default_routing_keys")]
    pub routing_keys: Vec<String>,

    /// Requeue deliveries whose handler failed.
    #[serde(default)]
    pub requeue_on_error: bool,
}

/// Demo publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Messages published at startup.
    #[serde(default = "default_demo_messages")]
    pub demo_messages: u32,

    /// Routing key used for demo messages.
    #[serde(default = "default_publish_routing_key")]
    pub routing_key: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_app_name() -> String {
    "relay".to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_exchange() -> String {
    "events".to_string()
}

fn default_queue() -> String {
    "worker".to_string()
}

fn default_routing_keys() -> Vec<String> {
    vec!["event_1".to_string()]
}

fn default_demo_messages() -> u32 {
    3
}

fn default_publish_routing_key() -> String {
    "event_1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            env: default_env(),
            exchange: default_exchange(),
            queue: default_queue(),
            routing_keys: default_routing_keys(),
            requeue_on_error: false,
        }
    }
}

impl ConsumerConfig {
    /// Fully qualified exchange name.
    #[must_use]
    pub fn exchange_name(&self) -> String {
        relay_protocol::exchange_name(&self.app_name, &self.exchange)
    }

    /// Fully qualified queue name.
    #[must_use]
    pub fn queue_name(&self) -> String {
        relay_protocol::queue_name(&self.app_name, &self.env, &self.queue)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            demo_messages: default_demo_messages(),
            routing_key: default_publish_routing_key(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, overridden by
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment variable holds an invalid value.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(file.as_deref(), Self::environment())
    }

    /// Load configuration from a specific file only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn environment() -> ::config::Environment {
        ::config::Environment::with_prefix("RELAY")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("consumer.routing_keys")
    }

    fn layered(file: Option<&Path>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            tracing::debug!(path = %path.display(), "Loading config file");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(env)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }
}
