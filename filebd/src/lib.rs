//! filebd: a file exposed as an NBD block device over TCP.
//!
//! One daemon serves one export. Each accepted connection runs its own
//! protocol engine with separate network and storage lanes, so socket I/O
//! and backing-store I/O overlap without ever interleaving on the wire.
//!
//! # Library Usage
//!
//! The primary API for running filebd is the [`Daemon`] struct:
//!
//! ```ignore
//! use filebd::{Config, Daemon};
//!
//! let daemon = Daemon::from_config(Config::default())?;
//! daemon.listen(listener).await?;
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod nbd;
pub mod store;

pub use config::{Config, DeviceConfig, NbdConfig, StorageConfig};
pub use daemon::Daemon;
pub use error::{ConfigError, Error, NbdError, Result, StoreError};
pub use nbd::{Connection, Export, Listener, Registry, StreamListener};
pub use store::{BackingStore, FileStore, MemStore};
