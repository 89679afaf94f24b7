//! File-backed store.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task;
use tracing::info;

use super::{BackingStore, StoreResult, check_range};
use crate::error::StoreError;

/// Backing store over a regular file.
///
/// The exported size is the file's size at open time. I/O uses positional
/// reads and writes, so commands at different offsets never contend on a
/// shared cursor; blocking file operations run on the blocking thread pool
/// and release the async worker while outstanding.
pub struct FileStore {
    file: Arc<File>,
    size: u64,
}

impl FileStore {
    /// Open `path` read-write and export it at its current size.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Err(StoreError::InvalidDeviceSize {
                reason: "backing file is empty",
            });
        }

        info!(path = %path.display(), size_bytes = size, "opened backing file");

        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }
}

#[async_trait]
impl BackingStore for FileStore {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes> {
        check_range(offset, length as u64, self.size)?;

        let file = Arc::clone(&self.file);
        let data = task::spawn_blocking(move || -> io::Result<Bytes> {
            let mut buf = vec![0u8; length];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(io::Error::other)??;

        Ok(data)
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> StoreResult<()> {
        check_range(offset, data.len() as u64, self.size)?;

        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(io::Error::other)??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backing_file(size: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; size]).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let f = backing_file(4096);
        let store = FileStore::open(f.path()).unwrap();
        assert_eq!(store.size(), 4096);

        store
            .write_at(100, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let data = store.read_at(100, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn out_of_range_rejected() {
        let f = backing_file(1024);
        let store = FileStore::open(f.path()).unwrap();

        let result = store.read_at(1000, 100).await;
        assert!(matches!(result, Err(StoreError::OutOfBounds { .. })));

        let result = store.write_at(1024, Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(StoreError::OutOfBounds { .. })));
    }

    #[test]
    fn empty_file_rejected() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let result = FileStore::open(f.path());
        assert!(matches!(
            result,
            Err(StoreError::InvalidDeviceSize { .. })
        ));
    }
}
