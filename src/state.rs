// Shared application state: the store and the gateway registry.
use crate::config::Config;
use crate::gateway::GatewayManager;
use crate::storage::{build_storage, StorageBackend};
use anyhow::{Context, Result};
use std::sync::Arc;

pub struct AppState {
    pub storage: Arc<dyn StorageBackend>,
    pub gateways: Arc<GatewayManager>,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self> {
        let storage = build_storage(&config.storage);
        storage
            .ensure_initialized()
            .context("storage initialization failed")?;
        let gateways = Arc::new(GatewayManager::new(storage.clone()));
        Ok(Self { storage, gateways })
    }
}
