//! NBD protocol constants and types.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Protocol constants are defined for completeness even if not all are currently used.

#![allow(dead_code)]

use std::io;

use thiserror::Error;

// Magic values
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;

// Handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client flags
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;

// Option types
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;

// Option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_ERR_UNSUP: u32 = 0x80000001;
pub const NBD_REP_ERR_INVALID: u32 = 0x80000003;
pub const NBD_REP_ERR_UNKNOWN: u32 = 0x80000006;

// Info types
pub const NBD_INFO_EXPORT: u16 = 0;

/// Maximum payload size per NBD protocol specification (32 MiB).
///
/// This is the default maximum that portable clients expect servers to support.
/// It bounds memory allocation for READ/WRITE buffers.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024; // 32 MiB

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISCONNECT: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
}

impl NbdCommand {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISCONNECT => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISCONNECT,
        }
    }
}

// Error codes for the reply `error` field
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_EOVERFLOW: u32 = 75;

/// Maximum length for option reply data during negotiation.
/// This prevents unbounded allocation from malicious servers.
pub const OPTION_REPLY_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("protocol negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("unsupported command: {command}")]
    UnsupportedCommand { command: u16 },

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("server error: {code}")]
    ServerError { code: u32 },

    #[error("handle mismatch: expected {expected}, got {actual}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

/// NBD request (28 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: NbdCommand,
    /// Client-chosen correlation token. Opaque to the server: it is echoed
    /// back byte-for-byte in the reply and never interpreted.
    pub handle: u64,
    pub offset: u64,
    /// Payload length, bounded by `NBD_MAX_PAYLOAD_SIZE` for Read/Write.
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    /// Serialize an NBD request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse and validate an NBD request.
    ///
    /// Read and Write transfer data and are limited to `NBD_MAX_PAYLOAD_SIZE`;
    /// Disconnect carries no payload and its length field is not bounded.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: magic,
            });
        }

        let flags = u16::from_be_bytes([buf[4], buf[5]]);
        let cmd = u16::from_be_bytes([buf[6], buf[7]]);
        let command =
            NbdCommand::from_u16(cmd).ok_or(NbdError::UnsupportedCommand { command: cmd })?;
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        let max_length = match command {
            NbdCommand::Read | NbdCommand::Write => NBD_MAX_PAYLOAD_SIZE,
            NbdCommand::Disconnect => u32::MAX,
        };

        if length > max_length {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: max_length,
            });
        }

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// NBD simple reply (16 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC,
                actual: magic,
            });
        }

        let error = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok(Self { error, handle })
    }
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
};
