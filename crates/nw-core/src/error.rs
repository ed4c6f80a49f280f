//! Core error types for netwarden

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{GroupId, Phase};

/// Top-level error type for the netwarden control plane
#[derive(Error, Debug)]
pub enum WardenError {
    /// The caller session is not tracked by the pool (never started, ended, or reaped)
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Transport-level failure reaching the device
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A remote command ran but reported an error that is not success-equivalent
    #[error("Command failed during {phase}: `{command}`: {stderr}")]
    CommandFailure {
        phase: Phase,
        command: String,
        stderr: String,
    },

    /// Malformed IP or MAC address in caller input
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// A device is already a member of another group
    #[error("Device {value} already belongs to group {group_id}")]
    DuplicateDevice { value: String, group_id: GroupId },

    /// Attempted mutation of the reserved default group
    #[error("Group {0} is protected and cannot be deleted")]
    ProtectedGroup(GroupId),

    /// No traffic-control class identifiers remain
    #[error("Traffic-control class pool exhausted (ceiling {ceiling})")]
    PoolExhausted { ceiling: u32 },

    /// The remote state document changed between load and write
    #[error("State document revision changed from {expected} to {found} during update")]
    StaleRevision { expected: u64, found: u64 },

    /// The state document could not be encoded
    #[error("State document error: {0}")]
    State(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WardenError {
    /// Whether the caller can fix the request and retry
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            WardenError::InvalidFormat(_)
                | WardenError::DuplicateDevice { .. }
                | WardenError::ProtectedGroup(_)
        )
    }
}

/// Connection-related errors
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// The allocation directory has no entry for the device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// TCP/SSH handshake failed
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// Authentication was rejected
    #[error("Authentication failed for {username}@{address}")]
    AuthenticationFailed { username: String, address: String },

    /// Credential material could not be loaded
    #[error("Credential error: {0}")]
    Credential(String),

    /// The established session failed while running a command
    #[error("Transport error: {0}")]
    Transport(String),

    /// The command did not finish within its timeout
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Result alias used throughout netwarden
pub type Result<T, E = WardenError> = std::result::Result<T, E>;
