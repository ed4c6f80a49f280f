//! Static connection directory

use async_trait::async_trait;
use dashmap::DashMap;

use nw_core::config::{DeviceEndpoint, WardenConfig};
use nw_core::error::{ConfigError, ConnectionError};
use nw_core::traits::{ConnectionParams, ConnectionResolver};
use nw_core::types::DeviceId;

/// Resolver backed by an in-memory directory, usually filled from config
#[derive(Default)]
pub struct StaticResolver {
    entries: DashMap<DeviceId, ConnectionParams>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[devices]` section of the config
    pub fn from_config(config: &WardenConfig) -> Result<Self, ConfigError> {
        let resolver = Self::new();
        for (id, endpoint) in &config.devices {
            resolver.insert_endpoint(DeviceId::new(id.as_str()), endpoint)?;
        }
        Ok(resolver)
    }

    pub fn insert_endpoint(
        &self,
        device: DeviceId,
        endpoint: &DeviceEndpoint,
    ) -> Result<(), ConfigError> {
        self.insert(device, endpoint.to_params()?);
        Ok(())
    }

    /// Add or replace a device's parameters
    pub fn insert(&self, device: DeviceId, params: ConnectionParams) {
        self.entries.insert(device, params);
    }

    /// Forget a device
    pub fn remove(&self, device: &DeviceId) -> Option<ConnectionParams> {
        self.entries.remove(device).map(|(_, params)| params)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ConnectionResolver for StaticResolver {
    async fn resolve(&self, device_id: &DeviceId) -> Result<ConnectionParams, ConnectionError> {
        self.entries
            .get(device_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConnectionError::DeviceNotFound(device_id.to_string()))
    }
}
