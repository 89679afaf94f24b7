//! Backing stores for the exported device.
//!
//! The transmission phase talks to storage exclusively through the
//! [`BackingStore`] trait: a size, positional reads, and positional writes.
//! Failures come back as [`StoreError`] values and are folded into per-command
//! error replies; they never terminate the connection.

mod file;
mod mem;

pub use file::FileStore;
pub use mem::MemStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage collaborator behind a connection's storage lane.
///
/// Implementations must support concurrent calls at different offsets; the
/// per-connection storage lane serializes its own commands, but separate
/// connections share one store.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Device size in bytes.
    fn size(&self) -> u64;

    /// Read `length` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes>;

    /// Write `data` starting at `offset`.
    async fn write_at(&self, offset: u64, data: Bytes) -> StoreResult<()>;
}

/// Reject ranges that fall outside the device.
pub(crate) fn check_range(offset: u64, length: u64, device_size: u64) -> StoreResult<()> {
    let end = offset.checked_add(length).ok_or(StoreError::OutOfBounds {
        offset,
        length,
        device_size,
    })?;
    if end > device_size {
        return Err(StoreError::OutOfBounds {
            offset,
            length,
            device_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_within_device() {
        assert!(check_range(0, 100, 100).is_ok());
        assert!(check_range(50, 50, 100).is_ok());
        assert!(check_range(100, 0, 100).is_ok());
    }

    #[test]
    fn range_past_end_rejected() {
        assert!(matches!(
            check_range(50, 51, 100),
            Err(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn range_overflow_rejected() {
        assert!(matches!(
            check_range(u64::MAX, 1, 100),
            Err(StoreError::OutOfBounds { .. })
        ));
    }
}
