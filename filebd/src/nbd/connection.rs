//! Per-connection NBD protocol engine.
//!
//! Each accepted socket gets one [`Connection`], which drives the whole state
//! machine: handshake, option haggling, the transmission phase, and the
//! disconnect drain. During transmission the connection splits into three
//! lanes, each a task that owns its half of the work outright:
//!
//! - the network read lane (this task) parses request frames and write
//!   payloads, one at a time, in arrival order;
//! - the storage lane performs backing-store I/O, one command at a time;
//! - the network write lane emits replies, one at a time, in the order
//!   commands completed.
//!
//! Commands move between lanes through channels, so no lane ever touches
//! another lane's state. Closing the dispatch channel is the drain signal:
//! the storage lane finishes its queue and closes the reply channel, the
//! writer flushes what remains, and only then does the socket close.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use nbd::*;

use super::command::{Command, CommandKind};
use crate::error::StoreError;
use crate::store::BackingStore;

/// Maximum length for option data during negotiation.
/// This prevents unbounded allocation from malicious clients.
const OPTION_DATA_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// Commands buffered between lanes before backpressure stalls the reader.
const LANE_DEPTH: usize = 64;

/// The export offered to every client.
///
/// There is a single default export; the name a client sends in its GO
/// option is not consulted.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub size_bytes: u64,
}

impl Export {
    fn transmission_flags(&self) -> u16 {
        NBD_FLAG_HAS_FLAGS
    }
}

/// A single client connection.
pub struct Connection {
    id: u64,
    store: Arc<dyn BackingStore>,
    export: Export,
    /// Commands dispatched but not yet fully replied to.
    in_flight: Arc<AtomicUsize>,
}

impl Connection {
    pub fn new(id: u64, store: Arc<dyn BackingStore>, export: Export) -> Self {
        Self {
            id,
            store,
            export,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serve the connection over any async stream.
    ///
    /// Performs the handshake and option haggling, then enters the
    /// transmission phase. Returns when the client disconnects or a
    /// protocol or socket error ends the connection.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.handshake(&mut stream).await?;
        self.negotiate_options(&mut stream).await?;
        self.transmission(stream).await
    }

    async fn handshake<S>(&self, stream: &mut S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut hello = [0u8; 18];
        hello[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        hello[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        let flags = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
        hello[16..18].copy_from_slice(&flags.to_be_bytes());
        stream.write_all(&hello).await?;

        // Client flags are accepted as-is; a client that cannot speak fixed
        // newstyle will fail the option phase on its own.
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        let client_flags = u32::from_be_bytes(buf);
        debug!(conn = self.id, client_flags, "handshake complete");

        Ok(())
    }

    async fn negotiate_options<S>(&self, stream: &mut S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut header = [0u8; 16];
            stream.read_exact(&mut header).await?;

            let magic = u64::from_be_bytes(header[0..8].try_into().unwrap());
            if magic != NBD_OPTS_MAGIC {
                return Err(NbdError::InvalidMagic {
                    expected: NBD_OPTS_MAGIC as u32,
                    actual: magic as u32,
                });
            }

            let option = u32::from_be_bytes(header[8..12].try_into().unwrap());
            let length = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;

            // Bound allocation to prevent DoS from malicious clients
            if length > OPTION_DATA_MAX_BYTES {
                return Err(NbdError::RequestTooLarge {
                    length_bytes: length as u32,
                    max_bytes: OPTION_DATA_MAX_BYTES as u32,
                });
            }

            let mut data = vec![0u8; length];
            stream.read_exact(&mut data).await?;

            debug!(conn = self.id, option, length, "client option");

            if option != NBD_OPT_GO {
                // Anything but GO is rejected outright; the client may try
                // again with GO on the same connection.
                send_option_reply(stream, option, NBD_REP_ERR_UNSUP).await?;
                continue;
            }

            // Option data: name length (u32), name, info request count
            // (u16), then the info request list. Both lengths come off the
            // wire and are checked against the data we actually read.
            if data.len() < 6 {
                send_option_reply(stream, option, NBD_REP_ERR_INVALID).await?;
                continue;
            }
            let name_len = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
            if data.len() < 4 + name_len + 2 {
                send_option_reply(stream, option, NBD_REP_ERR_INVALID).await?;
                continue;
            }
            let info_requests =
                u16::from_be_bytes(data[4 + name_len..4 + name_len + 2].try_into().unwrap());
            debug!(
                conn = self.id,
                name_len, info_requests, "accepting export request"
            );

            // One contiguous write: INFO(EXPORT) followed by ACK.
            let mut resp = BytesMut::with_capacity(52);
            resp.extend_from_slice(&option_reply_header(option, NBD_REP_INFO, 12));
            resp.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
            resp.extend_from_slice(&self.export.size_bytes.to_be_bytes());
            resp.extend_from_slice(&self.export.transmission_flags().to_be_bytes());
            resp.extend_from_slice(&option_reply_header(option, NBD_REP_ACK, 0));
            stream.write_all(&resp).await?;

            return Ok(());
        }
    }

    async fn transmission<S>(&self, stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(LANE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel(LANE_DEPTH);

        let storage = tokio::spawn(storage_lane(
            Arc::clone(&self.store),
            dispatch_rx,
            reply_tx,
        ));
        let writer = tokio::spawn(reply_writer(wr, reply_rx, Arc::clone(&self.in_flight)));

        // `read_requests` consumes the dispatch sender; its return drops the
        // sender and starts the drain cascade through both lanes.
        let read_result = self.read_requests(rd, dispatch_tx).await;

        storage
            .await
            .map_err(|e| NbdError::Io(io::Error::other(e)))?;
        let writer_result = writer
            .await
            .map_err(|e| NbdError::Io(io::Error::other(e)))?;

        debug!(conn = self.id, "transmission ended");
        read_result.and(writer_result)
    }

    async fn read_requests<S>(
        &self,
        mut rd: ReadHalf<S>,
        dispatch: mpsc::Sender<Command>,
    ) -> Result<(), NbdError>
    where
        S: AsyncRead,
    {
        let mut frame = [0u8; NbdRequest::SIZE_BYTES];

        loop {
            match rd.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(conn = self.id, "client closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let req = match NbdRequest::from_bytes(&frame) {
                Ok(req) => req,
                Err(NbdError::RequestTooLarge {
                    length_bytes,
                    max_bytes,
                }) => {
                    // Well-framed but oversized. The error reply is routed
                    // through the normal lanes so it cannot interleave with
                    // replies already in flight.
                    let handle = u64::from_be_bytes(frame[8..16].try_into().unwrap());
                    let cmd_code = u16::from_be_bytes([frame[6], frame[7]]);
                    warn!(
                        conn = self.id,
                        length_bytes, max_bytes, "rejecting oversized request"
                    );
                    let mut cmd = Command::read(handle, 0, 0);
                    cmd.fail(NBD_EOVERFLOW);
                    self.dispatch(&dispatch, cmd).await?;
                    if cmd_code == NBD_CMD_WRITE {
                        // The payload we refused to buffer is still on the
                        // wire; the stream cannot be re-framed past it.
                        return Err(NbdError::RequestTooLarge {
                            length_bytes,
                            max_bytes,
                        });
                    }
                    continue;
                }
                Err(e) => {
                    // Bad magic or unknown command type: protocol violation.
                    // Close without a reply.
                    warn!(conn = self.id, error = %e, "malformed request frame");
                    return Err(e);
                }
            };

            match req.command {
                NbdCommand::Read => {
                    let cmd = Command::read(req.handle, req.offset, req.length);
                    self.dispatch(&dispatch, cmd).await?;
                }
                NbdCommand::Write => {
                    // The payload must be fully drained before the next
                    // frame can be parsed; there is no other length prefix.
                    let len = req.length as usize;
                    let mut payload = BytesMut::with_capacity(len);
                    payload.resize(len, 0);
                    rd.read_exact(&mut payload).await?;

                    let cmd =
                        Command::write(req.handle, req.offset, req.length, payload.freeze());
                    self.dispatch(&dispatch, cmd).await?;
                }
                NbdCommand::Disconnect => {
                    // No reply is ever sent for a disconnect. The client
                    // sends nothing further; returning drains outstanding
                    // work before the socket closes.
                    debug!(
                        conn = self.id,
                        in_flight = self.in_flight.load(Ordering::Relaxed),
                        "disconnect requested, draining"
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(
        &self,
        dispatch: &mpsc::Sender<Command>,
        cmd: Command,
    ) -> Result<(), NbdError> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        dispatch.send(cmd).await.map_err(|_| {
            NbdError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "storage lane closed",
            ))
        })
    }
}

fn option_reply_header(option: u32, reply_type: u32, data_len: u32) -> [u8; 20] {
    let mut header = [0u8; 20];
    header[0..8].copy_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
    header[8..12].copy_from_slice(&option.to_be_bytes());
    header[12..16].copy_from_slice(&reply_type.to_be_bytes());
    header[16..20].copy_from_slice(&data_len.to_be_bytes());
    header
}

async fn send_option_reply<S>(stream: &mut S, option: u32, reply_type: u32) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&option_reply_header(option, reply_type, 0))
        .await?;
    Ok(())
}

/// Storage lane: backing-store I/O for one connection, one command at a time.
///
/// Commands arriving already failed (oversized requests) pass straight
/// through to the reply lane.
async fn storage_lane(
    store: Arc<dyn BackingStore>,
    mut commands: mpsc::Receiver<Command>,
    replies: mpsc::Sender<Command>,
) {
    while let Some(mut cmd) = commands.recv().await {
        if cmd.error == NBD_OK {
            run_command(store.as_ref(), &mut cmd).await;
        }
        if replies.send(cmd).await.is_err() {
            // Reply writer is gone; the connection is tearing down.
            return;
        }
    }
}

async fn run_command(store: &dyn BackingStore, cmd: &mut Command) {
    match cmd.kind {
        CommandKind::Read => match store.read_at(cmd.offset, cmd.length as usize).await {
            Ok(data) => cmd.buffer = data,
            Err(e) => {
                warn!(handle = cmd.handle, offset = cmd.offset, length = cmd.length, error = %e, "backing read failed");
                cmd.fail(reply_error_code(&e));
            }
        },
        CommandKind::Write => {
            let data = std::mem::take(&mut cmd.buffer);
            if let Err(e) = store.write_at(cmd.offset, data).await {
                warn!(handle = cmd.handle, offset = cmd.offset, length = cmd.length, error = %e, "backing write failed");
                cmd.fail(reply_error_code(&e));
            }
        }
    }
}

fn reply_error_code(err: &StoreError) -> u32 {
    match err {
        StoreError::OutOfBounds { .. } => NBD_EINVAL,
        _ => NBD_EIO,
    }
}

/// Network write lane: replies go out one at a time, in completion order,
/// never interleaved. Exits once the reply channel drains, which closes the
/// write side of the socket.
async fn reply_writer<S>(
    mut wr: WriteHalf<S>,
    mut replies: mpsc::Receiver<Command>,
    in_flight: Arc<AtomicUsize>,
) -> Result<(), NbdError>
where
    S: AsyncWrite,
{
    while let Some(cmd) = replies.recv().await {
        wr.write_all(&cmd.reply().to_bytes()).await?;
        if cmd.reply_has_payload() {
            wr.write_all(&cmd.buffer).await?;
        }
        in_flight.fetch_sub(1, Ordering::Relaxed);
    }
    // The peer may already be gone; nothing to do about a failed close.
    let _ = wr.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use tokio::io::duplex;
    use tokio::task::JoinHandle;

    const DEVICE_SIZE: u64 = 1024 * 1024;

    fn spawn_connection() -> (tokio::io::DuplexStream, JoinHandle<Result<(), NbdError>>) {
        let (client, server) = duplex(1024 * 1024);
        let store = Arc::new(MemStore::new(DEVICE_SIZE).unwrap());
        let export = Export {
            name: "test".to_string(),
            size_bytes: DEVICE_SIZE,
        };
        let conn = Connection::new(1, store, export);
        let handle = tokio::spawn(async move { conn.serve(server).await });
        (client, handle)
    }

    async fn client_handshake(client: &mut tokio::io::DuplexStream) {
        let mut hello = [0u8; 18];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello[0..8], &NBD_MAGIC.to_be_bytes());
        assert_eq!(&hello[8..16], &NBD_OPTS_MAGIC.to_be_bytes());
        let flags = u16::from_be_bytes([hello[16], hello[17]]);
        assert_eq!(flags, NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES);

        client
            .write_all(&NBD_FLAG_C_FIXED_NEWSTYLE.to_be_bytes())
            .await
            .unwrap();
    }

    async fn send_option(client: &mut tokio::io::DuplexStream, option: u32, data: &[u8]) {
        let mut header = [0u8; 16];
        header[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        header[8..12].copy_from_slice(&option.to_be_bytes());
        header[12..16].copy_from_slice(&(data.len() as u32).to_be_bytes());
        client.write_all(&header).await.unwrap();
        client.write_all(data).await.unwrap();
    }

    async fn read_option_reply(client: &mut tokio::io::DuplexStream) -> (u32, u32, Vec<u8>) {
        let mut header = [0u8; 20];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..8], &NBD_OPTION_REPLY_MAGIC.to_be_bytes());
        let option = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let reply_type = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let len = u32::from_be_bytes(header[16..20].try_into().unwrap()) as usize;
        let mut data = vec![0u8; len];
        client.read_exact(&mut data).await.unwrap();
        (option, reply_type, data)
    }

    /// GO option data: empty export name, zero info requests.
    fn go_default_export() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data
    }

    #[tokio::test]
    async fn go_negotiation_yields_info_then_ack() {
        let (mut client, _handle) = spawn_connection();
        client_handshake(&mut client).await;
        send_option(&mut client, NBD_OPT_GO, &go_default_export()).await;

        let (option, reply_type, data) = read_option_reply(&mut client).await;
        assert_eq!(option, NBD_OPT_GO);
        assert_eq!(reply_type, NBD_REP_INFO);
        assert_eq!(data.len(), 12);
        assert_eq!(u16::from_be_bytes(data[0..2].try_into().unwrap()), NBD_INFO_EXPORT);
        assert_eq!(
            u64::from_be_bytes(data[2..10].try_into().unwrap()),
            DEVICE_SIZE
        );
        let flags = u16::from_be_bytes(data[10..12].try_into().unwrap());
        assert_eq!(flags & NBD_FLAG_HAS_FLAGS, NBD_FLAG_HAS_FLAGS);

        let (option, reply_type, data) = read_option_reply(&mut client).await;
        assert_eq!(option, NBD_OPT_GO);
        assert_eq!(reply_type, NBD_REP_ACK);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn unsupported_option_rejected_then_go_succeeds() {
        let (mut client, _handle) = spawn_connection();
        client_handshake(&mut client).await;

        send_option(&mut client, NBD_OPT_INFO, &go_default_export()).await;
        let (option, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(option, NBD_OPT_INFO);
        assert_eq!(reply_type, NBD_REP_ERR_UNSUP);

        send_option(&mut client, NBD_OPT_GO, &go_default_export()).await;
        let (_, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_INFO);
    }

    #[tokio::test]
    async fn truncated_go_data_rejected_as_invalid() {
        let (mut client, _handle) = spawn_connection();
        client_handshake(&mut client).await;

        // Name length claims more bytes than the option data holds.
        let mut data = Vec::new();
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        send_option(&mut client, NBD_OPT_GO, &data).await;

        let (_, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_ERR_INVALID);
    }

    #[tokio::test]
    async fn oversized_option_data_closes_connection() {
        let (mut client, handle) = spawn_connection();
        client_handshake(&mut client).await;

        let mut header = [0u8; 16];
        header[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        header[8..12].copy_from_slice(&NBD_OPT_GO.to_be_bytes());
        header[12..16].copy_from_slice(&(OPTION_DATA_MAX_BYTES as u32 + 1).to_be_bytes());
        client.write_all(&header).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NbdError::RequestTooLarge { .. })));
    }

    #[tokio::test]
    async fn bad_option_magic_closes_connection() {
        let (mut client, handle) = spawn_connection();
        client_handshake(&mut client).await;

        let mut header = [0u8; 16];
        header[0..8].copy_from_slice(&0xDEADBEEFDEADBEEFu64.to_be_bytes());
        client.write_all(&header).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NbdError::InvalidMagic { .. })));
    }
}
