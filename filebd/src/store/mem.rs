//! In-memory store.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BackingStore, StoreResult, check_range};
use crate::error::StoreError;

/// Backing store over a zero-initialized memory buffer.
///
/// Used by the default configuration (no backing file) and by tests.
pub struct MemStore {
    data: RwLock<Vec<u8>>,
    size: u64,
}

impl MemStore {
    pub fn new(size_bytes: u64) -> StoreResult<Self> {
        if size_bytes == 0 {
            return Err(StoreError::InvalidDeviceSize {
                reason: "size must be > 0",
            });
        }
        Ok(Self {
            data: RwLock::new(vec![0u8; size_bytes as usize]),
            size: size_bytes,
        })
    }
}

#[async_trait]
impl BackingStore for MemStore {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes> {
        check_range(offset, length as u64, self.size)?;
        let data = self.data.read().await;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&data[start..start + length]))
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> StoreResult<()> {
        check_range(offset, data.len() as u64, self.size)?;
        let mut buf = self.data.write().await;
        let start = offset as usize;
        buf[start..start + data.len()].copy_from_slice(&data);
        Ok(())
    }
}
