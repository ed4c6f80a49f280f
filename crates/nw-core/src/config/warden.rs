//! Control-plane configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::DeviceEndpoint;

/// Default location of the state document on the router
pub const DEFAULT_STATE_PATH: &str = "/etc/netwarden/state.json";

/// Configuration for the netwarden control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Path of the state document on each router
    pub state_path: String,

    /// Timeout applied to every remote command
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Timeout for establishing an SSH session
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Connection pool tuning
    pub pool: PoolConfig,

    /// Traffic shaping parameters
    pub shaping: ShapingConfig,

    /// Static connection directory, keyed by device ID
    pub devices: HashMap<String, DeviceEndpoint>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            state_path: DEFAULT_STATE_PATH.to_string(),
            command_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
            shaping: ShapingConfig::default(),
            devices: HashMap::new(),
        }
    }
}

/// Idle thresholds for the connection pool reaper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How often the reaper runs
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,

    /// Connections unused for longer than this are closed
    #[serde(with = "duration_secs")]
    pub connection_idle_timeout: Duration,

    /// Sessions inactive for longer than this expire, closing their connections
    #[serde(with = "duration_secs")]
    pub session_idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30),
            connection_idle_timeout: Duration::from_secs(300),
            session_idle_timeout: Duration::from_secs(1800),
        }
    }
}

/// Bandwidth classes installed on the router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    /// Interface probed to decide whether shaping classes exist
    pub probe_interface: String,

    /// Shape only these interfaces; all non-loopback interfaces when empty
    pub interfaces: Vec<String>,

    /// Ceiling of the root class
    pub link_rate_mbit: u32,

    /// Rate of the unrestricted class
    pub unrestricted_rate_mbit: u32,

    /// Rate of the limited class
    pub limited_rate_mbit: u32,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            probe_interface: "br-lan".to_string(),
            interfaces: vec![],
            link_rate_mbit: 1000,
            unrestricted_rate_mbit: 1000,
            limited_rate_mbit: 1,
        }
    }
}

impl WardenConfig {
    /// Reject values that would render broken tc commands
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if !self.state_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "state_path must be absolute, got {}",
                self.state_path
            )));
        }
        let shaping = &self.shaping;
        if shaping.limited_rate_mbit == 0 || shaping.unrestricted_rate_mbit == 0 {
            return Err(ConfigError::Invalid(
                "shaping rates must be greater than zero".to_string(),
            ));
        }
        if shaping.unrestricted_rate_mbit > shaping.link_rate_mbit
            || shaping.limited_rate_mbit > shaping.link_rate_mbit
        {
            return Err(ConfigError::Invalid(
                "shaping rates cannot exceed link_rate_mbit".to_string(),
            ));
        }
        if self.pool.connection_idle_timeout > self.pool.session_idle_timeout {
            return Err(ConfigError::Invalid(
                "connection_idle_timeout must not exceed session_idle_timeout".to_string(),
            ));
        }
        Ok(())
    }
}
