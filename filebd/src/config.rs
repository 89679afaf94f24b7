//! Configuration for filebd.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error};
use crate::store::{BackingStore, FileStore, MemStore};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub nbd: NbdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Size of the in-memory device, in MiB. Ignored when a backing file is
    /// configured; the file's own size wins.
    pub size_mb: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { size_mb: 64 }
    }
}

impl DeviceConfig {
    pub fn size_bytes(&self) -> u64 {
        self.size_mb * 1024 * 1024
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "size_mb",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Path to the backing file. When unset, the device lives in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Open the configured backing store.
    pub fn build_store(&self, device: &DeviceConfig) -> Result<Arc<dyn BackingStore>, Error> {
        match self.path {
            Some(ref path) => Ok(Arc::new(FileStore::open(path)?)),
            None => Ok(Arc::new(MemStore::new(device.size_bytes())?)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdConfig {
    #[serde(default = "default_nbd_address")]
    pub address: String,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            address: default_nbd_address(),
        }
    }
}

fn default_nbd_address() -> String {
    "127.0.0.1:10809".to_string()
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.device.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_rejects_zero_size() {
        let config = DeviceConfig { size_mb: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn device_config_accepts_valid_size() {
        let config = DeviceConfig { size_mb: 100 };
        assert!(config.validate().is_ok());
        assert_eq!(config.size_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn storage_config_defaults_to_memory() {
        let config = Config::default();
        let store = config.storage.build_store(&config.device).unwrap();
        assert_eq!(store.size(), 64 * 1024 * 1024);
    }

    #[test]
    fn nbd_config_defaults() {
        let config = NbdConfig::default();
        assert_eq!(config.address, "127.0.0.1:10809");
    }

    #[test]
    fn parses_toml() {
        let config: Config = toml::from_str(
            r#"
            [device]
            size_mb = 16

            [nbd]
            address = "0.0.0.0:9999"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.size_mb, 16);
        assert_eq!(config.nbd.address, "0.0.0.0:9999");
        assert!(config.storage.path.is_none());
    }
}
