//! Configuration for shadowblk.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub nbd: NbdConfig,
    /// Write-queue connection. Omitted means the server runs file-only and
    /// publishes nothing.
    #[serde(default)]
    pub queue: Option<QueueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Export name clients must request byte-for-byte.
    pub name: String,
    /// Path to the backing file or block device.
    pub path: PathBuf,
    /// Declared export size in bytes. 0 means derive from the backing file,
    /// falling back to a synthetic huge size for empty/sparse files.
    pub size_bytes: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            name: default_export_name(),
            path: PathBuf::new(),
            size_bytes: 0,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "export.name",
                reason: "must not be empty",
            });
        }
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "export.path",
                reason: "backing file path is required",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    /// Bind address for the NBD listener.
    pub address: String,
    /// Serve the legacy fixed-size handshake instead of fixed newstyle.
    pub oldstyle: bool,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            address: default_nbd_address(),
            oldstyle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Address of the external queue server.
    pub address: String,
    /// Logical namespace (database index) selected on every connect.
    pub db: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            address: default_queue_address(),
            db: 0,
        }
    }
}

fn default_export_name() -> String {
    "shadowblk".to_string()
}

fn default_nbd_address() -> String {
    "127.0.0.1:10809".to_string()
}

fn default_queue_address() -> String {
    "127.0.0.1:6379".to_string()
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.export.validate()?;
        Ok(config)
    }
}
