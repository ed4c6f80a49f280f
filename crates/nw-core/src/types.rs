//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a policy group in the remote state document
pub type GroupId = u32;

/// The protected default group
pub const DEFAULT_GROUP: GroupId = 0;

/// Logical identifier of a managed router
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a new device ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a caller session in the connection pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A LAN client, identified by both its IP and MAC address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub ip: String,
    pub mac: String,
}

impl DeviceRef {
    pub fn new(ip: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            mac: mac.into(),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.ip, self.mac)
    }
}

/// Which access list, if any, is hooked into the router's forwarding path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveMode {
    /// No access list attached; forwarding is unmanaged
    None,
    /// Listed devices are unrestricted, everything else is limited
    AllowList,
    /// Listed devices are limited, everything else is unrestricted
    DenyList,
}

impl fmt::Display for ActiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveMode::None => write!(f, "none"),
            ActiveMode::AllowList => write!(f, "allow_list"),
            ActiveMode::DenyList => write!(f, "deny_list"),
        }
    }
}

/// Stage of a remote operation, attached to command failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Probe,
    State,
    Infrastructure,
    Teardown,
    Rebuild,
    Activate,
    RateLimit,
    GroupShaping,
    AccessControl,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Probe => "probe",
            Phase::State => "state",
            Phase::Infrastructure => "infrastructure",
            Phase::Teardown => "teardown",
            Phase::Rebuild => "rebuild",
            Phase::Activate => "activate",
            Phase::RateLimit => "rate-limit",
            Phase::GroupShaping => "group-shaping",
            Phase::AccessControl => "access-control",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Captured result of a command that ran on the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status reported by the remote shell, when the transport provides one
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_status: Some(0),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_status: Some(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&ActiveMode::AllowList).unwrap(),
            r#""allow_list""#
        );
        let mode: ActiveMode = serde_json::from_str(r#""deny_list""#).unwrap();
        assert_eq!(mode, ActiveMode::DenyList);
        assert_eq!(format!("{}", ActiveMode::None), "none");
    }

    #[test]
    fn test_device_ref_display() {
        let dev = DeviceRef::new("10.0.0.5", "aa:bb:cc:dd:ee:01");
        assert_eq!(dev.to_string(), "10.0.0.5 (aa:bb:cc:dd:ee:01)");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::RateLimit.to_string(), "rate-limit");
        assert_eq!(Phase::Teardown.to_string(), "teardown");
    }
}
