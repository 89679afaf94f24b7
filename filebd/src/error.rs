//! Error types for filebd.

use std::io;
use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("backing store error: {0}")]
    Store(#[from] StoreError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Backing store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "out of bounds: offset {offset} + length {length} exceeds device size {device_size}"
    )]
    OutOfBounds {
        offset: u64,
        length: u64,
        device_size: u64,
    },

    #[error("invalid device size: {reason}")]
    InvalidDeviceSize { reason: &'static str },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::OutOfBounds {
            offset: 100,
            length: 50,
            device_size: 120,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("120"));
    }
}
