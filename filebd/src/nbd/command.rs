//! In-flight request records for the transmission phase.

use bytes::Bytes;
use nbd::{NBD_OK, NbdReply};

/// Which backing-store operation a command performs.
///
/// Disconnect never becomes a `Command`; the reader handles it by closing
/// the dispatch lane, which drains outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Read,
    Write,
}

/// A single in-flight request.
///
/// Owned by exactly one lane at a time: created on the network lane when a
/// request frame is parsed, moved to the storage lane for backing-store I/O
/// (carrying the write payload), and moved back to the network lane for the
/// reply (carrying the read result). It is dropped once its reply is fully
/// written.
#[derive(Debug)]
pub(crate) struct Command {
    pub kind: CommandKind,
    /// Client-chosen correlation token, echoed verbatim in the reply.
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    /// Write payload on dispatch; read result on completion. Empty for
    /// failed commands and completed writes.
    pub buffer: Bytes,
    /// NBD error code for the reply; `NBD_OK` unless the command failed.
    pub error: u32,
}

impl Command {
    pub fn read(handle: u64, offset: u64, length: u32) -> Self {
        Self {
            kind: CommandKind::Read,
            handle,
            offset,
            length,
            buffer: Bytes::new(),
            error: NBD_OK,
        }
    }

    pub fn write(handle: u64, offset: u64, length: u32, payload: Bytes) -> Self {
        Self {
            kind: CommandKind::Write,
            handle,
            offset,
            length,
            buffer: payload,
            error: NBD_OK,
        }
    }

    /// Mark the command failed. The buffer is released; an error reply
    /// carries no payload.
    pub fn fail(&mut self, error: u32) {
        self.error = error;
        self.buffer = Bytes::new();
    }

    /// Whether the reply must be followed by the read payload.
    pub fn reply_has_payload(&self) -> bool {
        self.kind == CommandKind::Read && self.error == NBD_OK
    }

    pub fn reply(&self) -> NbdReply {
        NbdReply {
            error: self.error,
            handle: self.handle,
        }
    }
}
