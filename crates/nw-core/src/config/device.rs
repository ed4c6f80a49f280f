//! Router endpoint configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::traits::{ConnectionParams, Credential};

/// Connection entry for a known router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    /// Hostname or IP the SSH endpoint is reachable at
    pub address: String,

    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login user
    #[serde(default = "default_username")]
    pub username: String,

    /// Password authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Private key authentication (takes precedence over password)
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// SSH host key fingerprint for verification
    #[serde(default)]
    pub host_key: Option<String>,

    /// Notes/description for this router
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

impl DeviceEndpoint {
    /// Convert to the parameters the connector dials with
    pub fn to_params(&self) -> Result<ConnectionParams, ConfigError> {
        let credential = match (&self.key_path, &self.password) {
            (Some(path), _) => Credential::KeyFile(path.clone()),
            (None, Some(password)) => Credential::Password(password.clone()),
            (None, None) => {
                return Err(ConfigError::Invalid(format!(
                    "device at {} has neither key_path nor password",
                    self.address
                )))
            }
        };
        Ok(ConnectionParams {
            address: self.address.clone(),
            port: self.port,
            username: self.username.clone(),
            credential,
            host_key: self.host_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> DeviceEndpoint {
        DeviceEndpoint {
            address: "192.168.1.1".to_string(),
            port: 22,
            username: "root".to_string(),
            password: None,
            key_path: None,
            host_key: None,
            notes: None,
        }
    }

    #[test]
    fn test_key_takes_precedence() {
        let ep = DeviceEndpoint {
            password: Some("pw".into()),
            key_path: Some(PathBuf::from("/keys/router")),
            ..endpoint()
        };
        let params = ep.to_params().unwrap();
        assert_eq!(params.credential, Credential::KeyFile("/keys/router".into()));
        assert_eq!(params.endpoint(), "192.168.1.1:22");
    }

    #[test]
    fn test_missing_credential_is_invalid() {
        assert!(endpoint().to_params().is_err());
    }
}
