//! Daemon API for running filebd.
//!
//! Provides a clean interface for starting filebd with a given
//! configuration: open the backing store, then accept connections from any
//! [`Listener`] and hand each one to the [`Registry`].
//!
//! # Example
//!
//! ```ignore
//! use filebd::{Config, Daemon};
//! use tokio::net::TcpListener;
//!
//! let daemon = Daemon::from_config(Config::default())?;
//! let listener = TcpListener::bind(daemon.nbd_address()).await?;
//! daemon.listen(listener).await?;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{Error, NbdError};
use crate::nbd::{Connection, Export, Listener, Registry};
use crate::store::BackingStore;

/// A running filebd instance.
#[derive(Clone)]
pub struct Daemon {
    store: Arc<dyn BackingStore>,
    export: Export,
    registry: Arc<Registry>,
    config: Arc<Config>,
}

impl Daemon {
    /// Create a new daemon from configuration.
    ///
    /// Opens the backing store specified in config: a file when
    /// `storage.path` is set, otherwise an in-memory device.
    pub fn from_config(config: Config) -> Result<Self, Error> {
        config.device.validate()?;
        let store = config.storage.build_store(&config.device)?;

        let export = Export {
            name: "filebd".to_string(),
            size_bytes: store.size(),
        };

        Ok(Self {
            store,
            export,
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
        })
    }

    /// Get the daemon configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the NBD address from config.
    pub fn nbd_address(&self) -> &str {
        &self.config.nbd.address
    }

    /// Get the device size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.export.size_bytes
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept NBD connections from any listener until it closes.
    ///
    /// This is the main serving loop: each accepted socket becomes a
    /// [`Connection`] registered with and started by the [`Registry`].
    pub async fn listen<L>(&self, mut listener: L) -> Result<(), NbdError>
    where
        L: Listener,
    {
        info!(
            export = %self.export.name,
            size_bytes = self.export.size_bytes,
            "NBD server accepting connections"
        );

        loop {
            match listener.accept().await {
                Ok(stream) => {
                    let connection = Connection::new(
                        self.registry.next_id(),
                        Arc::clone(&self.store),
                        self.export.clone(),
                    );
                    self.registry.start(connection, stream).await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    // Channel closed (StreamListener exhausted) - normal exit
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_uses_device_size() {
        let daemon = Daemon::from_config(Config::default()).unwrap();
        assert_eq!(daemon.size_bytes(), 64 * 1024 * 1024);
        assert_eq!(daemon.nbd_address(), "127.0.0.1:10809");
    }

    #[test]
    fn from_config_rejects_zero_size() {
        let config = Config {
            device: crate::config::DeviceConfig { size_mb: 0 },
            ..Config::default()
        };
        assert!(Daemon::from_config(config).is_err());
    }
}
