//! Composition root

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nw_core::config::WardenConfig;
use nw_core::error::WardenError;
use nw_core::traits::{ConnectionResolver, Connector};
use nw_core::types::{DeviceId, SessionId};

use crate::connection::{spawn_reaper, ConnectionPool, SshConnector, StaticResolver};
use crate::shell::DeviceShell;
use crate::store::{DeviceLocks, RemoteStateStore};
use crate::sync::GroupSync;

/// Long-lived services shared by every caller
pub struct Controller {
    /// Configuration
    pub config: WardenConfig,
    /// Connection pool
    pub connections: Arc<ConnectionPool>,
    /// Per-router state document locks
    pub locks: Arc<DeviceLocks>,
}

impl Controller {
    /// Wire the services around the given collaborators
    pub fn new(
        config: WardenConfig,
        resolver: Arc<dyn ConnectionResolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let connections = Arc::new(ConnectionPool::new(resolver, connector, config.pool.clone()));
        Self {
            config,
            connections,
            locks: Arc::new(DeviceLocks::new()),
        }
    }

    /// SSH transport and the static directory from `[devices]`
    pub fn from_config(config: WardenConfig) -> Result<Self, WardenError> {
        config.validate()?;
        let resolver = Arc::new(StaticResolver::from_config(&config)?);
        let connector = Arc::new(SshConnector::new(config.connect_timeout));
        Ok(Self::new(config, resolver, connector))
    }

    /// Get the connection pool
    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.connections
    }

    /// Start the idle-connection reaper
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_reaper(Arc::clone(&self.connections), cancel)
    }

    pub fn shell(&self, session: &SessionId, device: &DeviceId) -> DeviceShell {
        DeviceShell::new(
            Arc::clone(&self.connections),
            session.clone(),
            device.clone(),
            self.config.command_timeout,
        )
    }

    pub fn store(&self, session: &SessionId, device: &DeviceId) -> RemoteStateStore {
        RemoteStateStore::new(
            self.shell(session, device),
            self.config.state_path.clone(),
            Arc::clone(&self.locks),
        )
    }

    /// Group operations for one router on behalf of one session
    pub fn group_sync(&self, session: &SessionId, device: &DeviceId) -> GroupSync {
        GroupSync::new(
            self.shell(session, device),
            self.store(session, device),
            self.config.shaping.clone(),
        )
    }
}
