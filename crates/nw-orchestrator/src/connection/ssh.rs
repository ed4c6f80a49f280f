//! SSH-backed command executor
//!
//! Each pooled connection is one russh client session; every command runs on
//! its own exec channel and its stdout/stderr are collected until the channel
//! closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;

use nw_core::error::ConnectionError;
use nw_core::traits::{CommandExecutor, ConnectionParams, Connector, Credential};
use nw_core::types::CommandOutput;

/// Opens SSH sessions to routers
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn CommandExecutor>, ConnectionError> {
        let endpoint = params.endpoint();
        let config = Arc::new(Config::default());
        let handler = ClientHandler::new(endpoint.clone(), params.host_key.clone());

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (params.address.as_str(), params.port), handler),
        )
        .await
        .map_err(|_| ConnectionError::ConnectFailed {
            address: endpoint.clone(),
            reason: "connection timed out".to_string(),
        })?
        .map_err(|e| ConnectionError::ConnectFailed {
            address: endpoint.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!("Authenticating as '{}' on {}", params.username, endpoint);
        let authenticated = match &params.credential {
            Credential::Password(password) => {
                handle
                    .authenticate_password(params.username.as_str(), password.as_str())
                    .await
            }
            Credential::KeyFile(path) => {
                let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                    ConnectionError::Credential(format!(
                        "failed to load key {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                handle
                    .authenticate_publickey(params.username.as_str(), Arc::new(key))
                    .await
            }
        }
        .map_err(|e| ConnectionError::ConnectFailed {
            address: endpoint.clone(),
            reason: format!("authentication error: {}", e),
        })?;

        if !authenticated {
            return Err(ConnectionError::AuthenticationFailed {
                username: params.username.clone(),
                address: endpoint,
            });
        }

        tracing::info!("Connected to router at {}", endpoint);
        Ok(Arc::new(SshExecutor { handle, endpoint }))
    }
}

/// An authenticated SSH session to one router
pub struct SshExecutor {
    handle: Handle<ClientHandler>,
    endpoint: String,
}

impl SshExecutor {
    async fn run(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectionError::Transport(format!("failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| ConnectionError::Transport(format!("failed to exec: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                // Extended data type 1 is stderr
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ConnectionError> {
        tracing::trace!("[{}] $ {}", self.endpoint, command);
        tokio::time::timeout(timeout, self.run(command))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))?
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("Error closing session to {}: {}", self.endpoint, e);
        }
    }
}

/// SSH client handler for router sessions
struct ClientHandler {
    endpoint: String,
    /// Expected host key fingerprint
    expected_host_key: Option<String>,
}

impl ClientHandler {
    fn new(endpoint: String, expected_host_key: Option<String>) -> Self {
        Self {
            endpoint,
            expected_host_key,
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Host key for {}: {}", self.endpoint, fingerprint);

        match &self.expected_host_key {
            Some(expected) if *expected != fingerprint => {
                tracing::error!(
                    "Host key mismatch for {}: expected {}, got {}",
                    self.endpoint,
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}
