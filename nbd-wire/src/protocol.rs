//! NBD protocol constants and message types.
//!
//! Protocol constants are defined for completeness even if not all are
//! currently used.

#![allow(dead_code)]

use bytes::Bytes;
use thiserror::Error;

// Magic values
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OLD_PROTOCOL_MAGIC: u64 = 0x00420281861253;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x3e889045565a9;

// Global handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;

// Export (transmission) flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

// Option codes
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;

// Option reply types
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_ERR_UNSUP: u32 = 0x80000001;
pub const NBD_REP_ERR_POLICY: u32 = 0x80000002;
pub const NBD_REP_ERR_INVALID: u32 = 0x80000003;

// Command codes
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISCONNECT: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

// Error codes carried in command replies (OS-style errno values)
pub const NBD_OK: u32 = 0;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;

/// Maximum payload size for commands that transfer data (32 MiB).
///
/// A request claiming a larger payload would force unbounded buffer growth
/// from an untrusted peer, so it is rejected as a protocol violation.
pub const NBD_MAX_PAYLOAD_BYTES: u32 = 32 * 1024 * 1024;

/// Maximum length for option payloads during negotiation (64 KiB).
pub const NBD_MAX_OPTION_BYTES: u32 = 64 * 1024;

// Wire sizes of the fixed-size message parts
pub const OLD_HANDSHAKE_BYTES: usize = 152;
pub const NEW_HANDSHAKE_BYTES: usize = 18;
pub const ZERO_ACK_BYTES: usize = 4;
pub const OPTION_HEADER_BYTES: usize = 16;
pub const OPTION_REPLY_BYTES: usize = 20;
pub const EXPORT_INFO_BYTES: usize = 134;
pub const REQUEST_BYTES: usize = 28;
pub const REPLY_BYTES: usize = 16;

/// Wire protocol violations.
///
/// Missing bytes are not an error (the codec signals those with `Ok(None)`);
/// every variant here means the peer sent something the protocol forbids.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid magic: expected 0x{expected:x}, got 0x{actual:x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("non-zero handshake acknowledgment: 0x{value:08x}")]
    NonZeroAck { value: u32 },

    #[error("unknown command code: {code}")]
    UnknownCommand { code: u32 },

    #[error("payload length {length} exceeds maximum {max}")]
    PayloadTooLarge { length: u32, max: u32 },

    #[error("option payload length {length} exceeds maximum {max}")]
    OptionTooLarge { length: u32, max: u32 },

    #[error("offset {offset} + length {length} overflows")]
    RangeOverflow { offset: u64, length: u32 },
}

/// A decoded option request from the negotiation phase.
///
/// Unknown options are a distinct variant so callers handle them explicitly
/// (the protocol requires an error reply, not a dropped connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionRequest {
    /// Select the export with the given name (raw bytes, compared verbatim).
    ExportName(Bytes),
    /// Client gives up on negotiation.
    Abort,
    /// Export listing; not supported by this server.
    List,
    /// Any option code this implementation does not recognize.
    Unknown { code: u32 },
}

impl OptionRequest {
    /// The wire code of this option, echoed in option replies.
    pub fn code(&self) -> u32 {
        match self {
            Self::ExportName(_) => NBD_OPT_EXPORT_NAME,
            Self::Abort => NBD_OPT_ABORT,
            Self::List => NBD_OPT_LIST,
            Self::Unknown { code } => *code,
        }
    }
}

/// A decoded command request (28-byte header plus payload for writes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    pub command: Command,
}

/// Command dispatched in the data-pushing phase.
///
/// Write carries its full payload: the codec never yields a write before the
/// complete payload is buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Read,
    Write(Bytes),
    Disconnect,
    Flush,
    Trim,
}

const _: () = {
    // old handshake: magic + protocol + size + flags + 124 reserved
    assert!(OLD_HANDSHAKE_BYTES == 8 + 8 + 8 + 4 + 124);
    // new handshake: magic + protocol + global flags
    assert!(NEW_HANDSHAKE_BYTES == 8 + 8 + 2);
    // export info: size + export flags + 124 reserved
    assert!(EXPORT_INFO_BYTES == 8 + 2 + 124);
    // request: magic + type + handle + offset + length
    assert!(REQUEST_BYTES == 4 + 4 + 8 + 8 + 4);
    // reply: magic + error + handle
    assert!(REPLY_BYTES == 4 + 4 + 8);
};
