//! Listener trait and implementations for accepting NBD connections.
//!
//! Abstracts over connection sources so the daemon can serve real TCP
//! sockets in production and in-memory duplex streams in tests.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Trait for accepting incoming connections.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next incoming connection.
    async fn accept(&mut self) -> std::io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        TcpListener::accept(self)
            .await
            .map(|(stream, _addr)| stream)
    }
}

/// A listener that accepts streams from a channel.
///
/// Tests push `tokio::io::duplex` streams through the sender half and the
/// daemon accepts them as if they were sockets. Accept fails with
/// `BrokenPipe` once the sender is dropped, which the daemon treats as a
/// normal exit.
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
}

impl<S> StreamListener<S> {
    /// Create a new stream listener with the given buffer capacity.
    ///
    /// Returns the sender half for pushing streams and the listener.
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn stream_listener_accepts_in_order() {
        let (tx, mut listener) = StreamListener::new(2);

        let (_, server1) = duplex(1024);
        let (_, server2) = duplex(1024);

        tx.send(server1).await.unwrap();
        tx.send(server2).await.unwrap();

        listener.accept().await.unwrap();
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn stream_listener_errors_when_closed() {
        let (tx, mut listener) = StreamListener::<tokio::io::DuplexStream>::new(1);
        drop(tx);

        let result = listener.accept().await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);
    }
}
