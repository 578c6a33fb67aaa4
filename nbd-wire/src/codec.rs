//! Incremental encode/decode of NBD wire messages.
//!
//! All decode functions share one contract: `Ok(None)` means "need more
//! data" and leaves the buffer untouched; `Ok(Some(_))` consumes exactly one
//! complete message; `Err` is a protocol violation and the connection should
//! be dropped. Messages with a trailing payload (option requests, write
//! commands) are decoded atomically: the header is not consumed until the
//! full payload is buffered.
//!
//! All multi-byte integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::*;

/// Encode the old-style (unilateral) handshake.
///
/// No negotiation follows it; the connection moves straight to the command
/// phase.
pub fn encode_old_handshake(size: u64, export_flags: u32, out: &mut BytesMut) {
    out.reserve(OLD_HANDSHAKE_BYTES);
    out.put_u64(NBD_MAGIC);
    out.put_u64(NBD_OLD_PROTOCOL_MAGIC);
    out.put_u64(size);
    out.put_u32(export_flags);
    out.put_bytes(0, 124);
}

/// Encode the fixed-newstyle handshake greeting.
pub fn encode_new_handshake(global_flags: u16, out: &mut BytesMut) {
    out.reserve(NEW_HANDSHAKE_BYTES);
    out.put_u64(NBD_MAGIC);
    out.put_u64(NBD_OPTS_MAGIC);
    out.put_u16(global_flags);
}

/// Decode the client's 4-byte zero acknowledgment of the newstyle handshake.
///
/// A non-zero value is a violation: the client did not accept fixed
/// newstyle, and the server disconnects without responding.
pub fn decode_zero_ack(buf: &mut BytesMut) -> Result<Option<()>, WireError> {
    if buf.len() < ZERO_ACK_BYTES {
        return Ok(None);
    }
    let value = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if value != 0 {
        return Err(WireError::NonZeroAck { value });
    }
    buf.advance(ZERO_ACK_BYTES);
    Ok(Some(()))
}

/// Decode one option request (16-byte header plus declared payload).
pub fn decode_option_request(buf: &mut BytesMut) -> Result<Option<OptionRequest>, WireError> {
    if buf.len() < OPTION_HEADER_BYTES {
        return Ok(None);
    }

    let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    if magic != NBD_OPTS_MAGIC {
        return Err(WireError::InvalidMagic {
            expected: NBD_OPTS_MAGIC,
            actual: magic,
        });
    }

    let code = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let length = u32::from_be_bytes(buf[12..16].try_into().unwrap());

    // Bound the receive buffer against a hostile declared length.
    if length > NBD_MAX_OPTION_BYTES {
        return Err(WireError::OptionTooLarge {
            length,
            max: NBD_MAX_OPTION_BYTES,
        });
    }

    if buf.len() < OPTION_HEADER_BYTES + length as usize {
        return Ok(None);
    }

    buf.advance(OPTION_HEADER_BYTES);
    let data = buf.split_to(length as usize).freeze();

    Ok(Some(match code {
        NBD_OPT_EXPORT_NAME => OptionRequest::ExportName(data),
        NBD_OPT_ABORT => OptionRequest::Abort,
        NBD_OPT_LIST => OptionRequest::List,
        _ => OptionRequest::Unknown { code },
    }))
}

/// Encode an option reply header followed by `data`.
pub fn encode_option_reply(option: u32, reply_type: u32, data: &[u8], out: &mut BytesMut) {
    out.reserve(OPTION_REPLY_BYTES + data.len());
    out.put_u64(NBD_OPTION_REPLY_MAGIC);
    out.put_u32(option);
    out.put_u32(reply_type);
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

/// Encode the export-info reply that answers a matching export-name option.
pub fn encode_export_info(size: u64, export_flags: u16, out: &mut BytesMut) {
    out.reserve(EXPORT_INFO_BYTES);
    out.put_u64(size);
    out.put_u16(export_flags);
    out.put_bytes(0, 124);
}

/// Decode one command request.
///
/// Writes are held back until the complete payload is buffered, so a
/// returned `Command::Write` always carries exactly `length` bytes. Field
/// validation happens here: oversized payload claims, offset+length
/// overflow, and unknown command codes are all violations.
pub fn decode_request(buf: &mut BytesMut) -> Result<Option<Request>, WireError> {
    if buf.len() < REQUEST_BYTES {
        return Ok(None);
    }

    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != NBD_REQUEST_MAGIC {
        return Err(WireError::InvalidMagic {
            expected: NBD_REQUEST_MAGIC as u64,
            actual: magic as u64,
        });
    }

    let code = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
    let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
    let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());

    if matches!(code, NBD_CMD_READ | NBD_CMD_WRITE) {
        if length > NBD_MAX_PAYLOAD_BYTES {
            return Err(WireError::PayloadTooLarge {
                length,
                max: NBD_MAX_PAYLOAD_BYTES,
            });
        }
        if offset.checked_add(length as u64).is_none() {
            return Err(WireError::RangeOverflow { offset, length });
        }
    }

    let command = match code {
        NBD_CMD_READ => Command::Read,
        NBD_CMD_WRITE => {
            if buf.len() < REQUEST_BYTES + length as usize {
                return Ok(None);
            }
            buf.advance(REQUEST_BYTES);
            return Ok(Some(Request {
                handle,
                offset,
                length,
                command: Command::Write(buf.split_to(length as usize).freeze()),
            }));
        }
        NBD_CMD_DISCONNECT => Command::Disconnect,
        NBD_CMD_FLUSH => Command::Flush,
        NBD_CMD_TRIM => Command::Trim,
        _ => return Err(WireError::UnknownCommand { code }),
    };

    buf.advance(REQUEST_BYTES);
    Ok(Some(Request {
        handle,
        offset,
        length,
        command,
    }))
}

/// Encode a command reply header.
///
/// Read payloads are appended by the caller directly after the header.
pub fn encode_reply(handle: u64, error: u32, out: &mut BytesMut) {
    out.reserve(REPLY_BYTES);
    out.put_u32(NBD_REPLY_MAGIC);
    out.put_u32(error);
    out.put_u64(handle);
}
