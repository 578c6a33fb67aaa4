//! NBD (Network Block Device) wire protocol.
//!
//! This crate provides the fixed binary message shapes of the NBD protocol
//! (handshakes, option negotiation, command requests and replies) together
//! with an incremental codec suitable for parsing an untrusted, partially
//! delivered byte stream.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Decode functions never fail just because bytes are missing: they return
//! `Ok(None)` and consume nothing until one complete message is buffered.
//! `Err` always means a protocol violation.

mod codec;
mod protocol;

pub use codec::*;
pub use protocol::*;
