//! Device configuration file
//!
//! Configuration is read from TOML. Secrets never live in the file: the
//! credentials secret is looked up at runtime from the environment variable
//! named by `credentials_secret_env`.

use crate::interfaces::{Interface, InterfaceLoadError};
use crate::protocol::is_valid_device_id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub interfaces: InterfacesSection,
}

/// Identity of the device and where to pair it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (22 character URL-safe base64)
    pub id: String,
    /// Realm the device belongs to
    pub realm: String,
    /// Environment variable containing the credentials secret
    #[serde(default = "default_credentials_secret_env")]
    pub credentials_secret_env: String,
    /// Base URL of the pairing API
    pub pairing_url: String,
    /// Directory holding certificates and other persistent state
    pub persistency_dir: Option<PathBuf>,
}

fn default_credentials_secret_env() -> String {
    "ASTARTE_CREDENTIALS_SECRET".to_string()
}

/// Connection behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default = "default_broker_retry_interval")]
    pub broker_retry_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_ms: u64,
    /// PEM file with custom certificate authorities
    pub trust_anchors: Option<PathBuf>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_broker_retry_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_disconnect_grace() -> u64 {
    2000
}

fn default_keep_alive() -> u64 {
    60
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            broker_retry_interval_secs: default_broker_retry_interval(),
            connect_timeout_secs: default_connect_timeout(),
            disconnect_grace_ms: default_disconnect_grace(),
            trust_anchors: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl ConnectionSection {
    pub fn broker_retry_interval(&self) -> Duration {
        Duration::from_secs(self.broker_retry_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Where interface definitions are loaded from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InterfacesSection {
    /// Directory scanned for `*.json` interface definitions
    pub directory: Option<PathBuf>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to load interface {path}: {source}")]
    Interface {
        path: PathBuf,
        #[source]
        source: InterfaceLoadError,
    },
}

impl DeviceConfig {
    /// Load configuration from a TOML file
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;

        if let Some(base) = path.parent() {
            config.resolve_relative_paths(base);
        }

        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_device_id(&self.device.id) {
            return Err(ConfigError::InvalidDeviceId(format!(
                "'{}' is not a 22 character URL-safe base64 identifier",
                self.device.id
            )));
        }

        if self.device.realm.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.realm must not be empty".to_string(),
            ));
        }

        self.pairing_url()?;

        if self.connection.broker_retry_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection.broker_retry_interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        if let Some(dir) = self.device.persistency_dir.as_mut() {
            resolve(dir);
        }
        if let Some(anchors) = self.connection.trust_anchors.as_mut() {
            resolve(anchors);
        }
        if let Some(dir) = self.interfaces.directory.as_mut() {
            resolve(dir);
        }
    }

    /// Parsed pairing API base URL
    pub fn pairing_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.device.pairing_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "device.pairing_url '{}' is not a valid URL: {e}",
                self.device.pairing_url
            ))
        })
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Get the credentials secret from its environment variable
    pub fn get_credentials_secret(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.device.credentials_secret_env)
    }

    /// Load every `*.json` interface definition from the configured directory
    ///
    /// Files are read in name order; no directory means no interfaces.
    pub fn load_interfaces(&self) -> Result<Vec<Interface>, ConfigError> {
        let Some(dir) = &self.interfaces.directory else {
            return Ok(Vec::new());
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .map(|path| {
                Interface::from_file(&path).map_err(|source| ConfigError::Interface {
                    path: path.clone(),
                    source,
                })
            })
            .collect()
    }
}
