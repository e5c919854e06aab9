//! Pool of broker clients keyed by connection identity.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientError, Connector};
use crate::config::ClientConfig;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// One or more clients failed to close. Every client was still tried.
    #[error("{} client(s) failed to close: {}", .0.len(), describe(.0))]
    Close(Vec<(String, ClientError)>),
}

fn describe(failures: &[(String, ClientError)]) -> String {
    failures
        .iter()
        .map(|(identity, err)| format!("{}: {}", identity, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Keeps at most one live client per identity.
pub struct ClientPool<K: Connector> {
    connector: K,
    /// Clients indexed by identity.
    clients: RwLock<HashMap<String, Arc<K::Client>>>,
}

impl<K: Connector> ClientPool<K> {
    /// Create an empty pool building clients with `connector`.
    #[must_use]
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the client for `config.identity()`.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if a new client cannot be created.
    pub async fn register(&self, config: &ClientConfig) -> Result<Arc<K::Client>, ClientError> {
        self.register_as(config.identity(), config).await
    }

    /// Get or create the client stored under an explicit `identity`.
    ///
    /// Concurrent calls for the same identity construct a single client.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if a new client cannot be created.
    pub async fn register_as(
        &self,
        identity: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Arc<K::Client>, ClientError> {
        let identity = identity.into();

        if let Some(client) = self.get(&identity).await {
            debug!(identity = %identity, "Reusing pooled client");
            return Ok(client);
        }

        let mut clients = self.clients.write().await;

        // Another registration may have won the race for the write lock.
        if let Some(client) = clients.get(&identity) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(self.connector.connect(config).await?);
        clients.insert(identity.clone(), Arc::clone(&client));
        info!(identity = %identity, "Registered broker client");

        Ok(client)
    }

    /// Get the client stored under `identity`.
    pub async fn get(&self, identity: &str) -> Option<Arc<K::Client>> {
        self.clients.read().await.get(identity).cloned()
    }

    /// Get all identities in the pool.
    pub async fn identities(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Number of pooled clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Check if the pool is empty.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Close every pooled client and empty the pool.
    ///
    /// Each client gets exactly one close attempt, even after earlier
    /// failures. Calling `close` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Close`] listing every client that failed.
    pub async fn close(&self) -> Result<(), PoolError> {
        let mut clients = self.clients.write().await;
        let mut failures = Vec::new();

        for (identity, client) in clients.drain() {
            match client.close().await {
                Ok(()) => debug!(identity = %identity, "Closed broker client"),
                Err(err) => {
                    warn!(identity = %identity, error = %err, "Failed to close broker client");
                    failures.push((identity, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Close(failures))
        }
    }
}
