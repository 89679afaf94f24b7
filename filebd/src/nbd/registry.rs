//! Bookkeeping for live connections.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::Connection;

/// The set of live connections.
///
/// Existence in the set implies liveness: a connection is inserted when it
/// is started and removed when its serving task finishes, from whichever
/// task observes the closure. The registry holds no protocol state.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new connection.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a connection and invoke its entry point on a new task.
    ///
    /// The connection unregisters itself when serving ends, however it ends.
    pub async fn start<S>(self: &Arc<Self>, connection: Connection, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = connection.id();
        self.live.lock().await.insert(id);
        debug!(conn = id, "connection registered");

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = connection.serve(stream).await {
                warn!(conn = id, error = %e, "connection ended with error");
            }
            registry.stop(id).await;
        })
    }

    /// Remove a connection from the live set.
    pub async fn stop(&self, id: u64) {
        if self.live.lock().await.remove(&id) {
            debug!(conn = id, "connection unregistered");
        }
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.live.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.live.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbd::connection::Export;
    use crate::store::MemStore;
    use tokio::io::duplex;

    #[tokio::test]
    async fn start_and_stop_track_liveness() {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(MemStore::new(1024).unwrap());
        let export = Export {
            name: "test".to_string(),
            size_bytes: 1024,
        };

        let (client, server) = duplex(4096);
        let conn = Connection::new(registry.next_id(), store, export);
        let id = conn.id();
        let handle = registry.start(conn, server).await;
        assert_eq!(registry.len().await, 1);

        // Dropping the client side fails the handshake and ends the task,
        // which unregisters the connection.
        drop(client);
        handle.await.unwrap();
        assert_eq!(registry.len().await, 0);

        // Redundant stop is harmless.
        registry.stop(id).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = Registry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
    }
}
