//! Remote command execution traits

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConnectionError;
use crate::types::{CommandOutput, DeviceId};

/// A live command channel to one router.
///
/// `Err` is reserved for transport and timeout failures. A command that ran and
/// wrote to stderr is an `Ok` with a non-empty `stderr`.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a shell command on the device
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ConnectionError>;

    /// Whether the underlying transport still looks usable
    fn is_alive(&self) -> bool;

    /// Close the transport
    async fn close(&self);
}

/// How to authenticate against a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

/// Connection parameters for a router, as handed out by the allocation service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// Pinned host key fingerprint; any key is accepted when unset
    pub host_key: Option<String>,
}

impl ConnectionParams {
    /// `host:port` form used for dialing and logging
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Maps a logical device identifier to live connection parameters
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, device_id: &DeviceId) -> Result<ConnectionParams, ConnectionError>;
}

/// Establishes new executors from connection parameters
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn CommandExecutor>, ConnectionError>;
}
