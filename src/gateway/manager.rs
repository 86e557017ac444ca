// Process-wide registry of gateway connections, keyed by gateway id.
// Register/unregister carry the persistence side effects; routers only look
// connections up.
use crate::gateway::{GatewayConnection, GatewaySnapshot};
use crate::storage::{GatewayRecord, StorageBackend};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub connected: bool,
    pub agents: Vec<Value>,
    pub models: Vec<Value>,
    pub default_model: Option<String>,
}

impl GatewayStatus {
    fn from_connection(connection: &GatewayConnection) -> Self {
        let GatewaySnapshot {
            agents,
            models,
            default_model,
        } = connection.snapshot();
        Self {
            connected: connection.is_connected(),
            agents,
            models,
            default_model,
        }
    }
}

pub struct GatewayManager {
    storage: Arc<dyn StorageBackend>,
    connections: RwLock<HashMap<String, Arc<GatewayConnection>>>,
}

impl GatewayManager {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Builds a connection for every stored config and starts dialing. A
    /// gateway that fails to dial keeps retrying on its own and never blocks
    /// the others.
    pub async fn start(&self) -> Result<()> {
        let stored = self.storage.list_gateways()?;
        let mut connections = self.connections.write().await;
        for record in stored {
            let auth = self
                .storage
                .get_gateway_auth(&record.id)?
                .unwrap_or_default();
            let connection =
                GatewayConnection::new(record.id.clone(), record.url.clone(), auth);
            connection.clone().start();
            connections.insert(record.id.clone(), connection);
        }
        info!(count = connections.len(), "gateway connections started");
        Ok(())
    }

    /// Persists the config, then constructs and dials the connection.
    pub async fn register(
        &self,
        gateway_id: &str,
        name: &str,
        url: &str,
        token: Option<&str>,
        password: Option<&str>,
    ) -> Result<GatewayRecord> {
        let record = self
            .storage
            .add_gateway(gateway_id, name, url, token, password)?;
        let auth = self
            .storage
            .get_gateway_auth(&record.id)?
            .unwrap_or_default();
        let connection = GatewayConnection::new(record.id.clone(), record.url.clone(), auth);
        connection.clone().start();
        self.connections
            .write()
            .await
            .insert(record.id.clone(), connection);
        Ok(record)
    }

    /// Stops the connection and deletes the config; sessions and messages
    /// cascade away with it.
    pub async fn unregister(&self, gateway_id: &str) -> Result<bool> {
        let removed = self.connections.write().await.remove(gateway_id);
        if let Some(connection) = removed {
            connection.stop().await;
        }
        self.storage.delete_gateway(gateway_id)
    }

    pub async fn get(&self, gateway_id: &str) -> Option<Arc<GatewayConnection>> {
        self.connections.read().await.get(gateway_id).cloned()
    }

    pub async fn contains(&self, gateway_id: &str) -> bool {
        self.connections.read().await.contains_key(gateway_id)
    }

    pub async fn status(&self, gateway_id: &str) -> Option<GatewayStatus> {
        let connection = self.get(gateway_id).await?;
        Some(GatewayStatus::from_connection(&connection))
    }

    /// Shutdown path: disable reconnect everywhere, close sockets, flush
    /// pending requests.
    pub async fn shutdown(&self) {
        let drained = {
            let mut connections = self.connections.write().await;
            connections.drain().collect::<Vec<_>>()
        };
        for (gateway_id, connection) in drained {
            connection.stop().await;
            info!(gateway = %gateway_id, "gateway connection stopped");
        }
    }
}

/// Seeds a `default` gateway when the table is empty, so a fresh install
/// pointed at one upstream works without a REST round-trip.
pub async fn seed_default_gateway(
    storage: &Arc<dyn StorageBackend>,
    seed_url: Option<&str>,
) -> Result<()> {
    let Some(url) = seed_url.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(());
    };
    if !storage.list_gateways()?.is_empty() {
        return Ok(());
    }
    match storage.add_gateway("default", "Default Gateway", url, None, None) {
        Ok(_) => info!(url, "seeded default gateway"),
        Err(err) => warn!(error = %err, "default gateway seed failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use tempfile::TempDir;

    fn test_storage(dir: &TempDir) -> Arc<dyn StorageBackend> {
        let path = dir.path().join("manager.db");
        Arc::new(SqliteStorage::new(path.to_string_lossy().to_string()))
    }

    #[tokio::test]
    async fn register_creates_exactly_one_handle_per_stored_config() {
        let dir = TempDir::new().expect("temp dir");
        let storage = test_storage(&dir);
        let manager = GatewayManager::new(storage.clone());

        manager
            .register("g1", "One", "ws://127.0.0.1:1/ws", Some("tok"), None)
            .await
            .expect("register");
        assert!(manager.contains("g1").await);
        assert_eq!(storage.list_gateways().expect("list").len(), 1);

        let status = manager.status("g1").await.expect("status");
        assert!(!status.connected);
        assert!(status.agents.is_empty());
    }

    #[tokio::test]
    async fn duplicate_register_leaves_registry_untouched() {
        let dir = TempDir::new().expect("temp dir");
        let storage = test_storage(&dir);
        let manager = GatewayManager::new(storage.clone());
        manager
            .register("g1", "One", "ws://127.0.0.1:1/ws", None, None)
            .await
            .expect("register");
        let err = manager
            .register("g1", "Two", "ws://127.0.0.1:2/ws", None, None)
            .await
            .expect_err("duplicate rejected");
        assert!(err
            .downcast_ref::<crate::storage::AlreadyExists>()
            .is_some());
        assert_eq!(storage.list_gateways().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_handle_and_stored_config() {
        let dir = TempDir::new().expect("temp dir");
        let storage = test_storage(&dir);
        let manager = GatewayManager::new(storage.clone());
        manager
            .register("g1", "One", "ws://127.0.0.1:1/ws", None, None)
            .await
            .expect("register");
        assert!(manager.unregister("g1").await.expect("unregister"));
        assert!(!manager.contains("g1").await);
        assert!(storage.list_gateways().expect("list").is_empty());
        assert!(manager.status("g1").await.is_none());
    }

    #[tokio::test]
    async fn start_loads_stored_configs() {
        let dir = TempDir::new().expect("temp dir");
        let storage = test_storage(&dir);
        storage
            .add_gateway("g1", "One", "ws://127.0.0.1:1/ws", None, None)
            .expect("seed");
        storage
            .add_gateway("g2", "Two", "ws://127.0.0.1:2/ws", None, None)
            .expect("seed");

        let manager = GatewayManager::new(storage.clone());
        manager.start().await.expect("start");
        assert!(manager.contains("g1").await);
        assert!(manager.contains("g2").await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn seed_only_applies_to_empty_table() {
        let dir = TempDir::new().expect("temp dir");
        let storage = test_storage(&dir);
        seed_default_gateway(&storage, Some("ws://127.0.0.1:9/ws"))
            .await
            .expect("seed");
        assert_eq!(storage.list_gateways().expect("list").len(), 1);

        seed_default_gateway(&storage, Some("ws://other/ws"))
            .await
            .expect("seed again");
        let listed = storage.list_gateways().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].url, "ws://127.0.0.1:9/ws");
    }
}
