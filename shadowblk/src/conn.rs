//! Per-connection protocol state machine.
//!
//! The machine is sans-IO: the connection driver appends raw network bytes
//! to the receive buffer and calls [`Client::advance`], which drains every
//! complete buffered message and appends responses to the output buffer. It
//! never blocks waiting for bytes; the only suspension point is the codec's
//! "need more data" signal. This re-entrant draining avoids head-of-line
//! stalls from the transport's read granularity.
//!
//! State flow (fixed newstyle):
//! `HandshakeSent -> ZeroReceived -> OptionNegotiating -> DataPushing ->
//! Disconnected`. Old-style connections skip negotiation and start in
//! `DataPushing`. `Disconnected` is terminal; the driver closes the socket
//! once pending output is flushed.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, warn};

use nbd_wire::{
    decode_option_request, decode_request, decode_zero_ack, encode_export_info,
    encode_new_handshake, encode_old_handshake, encode_option_reply, encode_reply, Command,
    OptionRequest, Request, NBD_EINVAL, NBD_FLAG_FIXED_NEWSTYLE, NBD_FLAG_HAS_FLAGS,
    NBD_FLAG_ROTATIONAL, NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_FUA, NBD_FLAG_SEND_TRIM, NBD_OK,
    NBD_REP_ERR_UNSUP,
};

use crate::queue::WriteQueue;
use crate::store::{nbd_errno, Export, SECTOR_SIZE};

/// Export flags advertised in the export-info reply.
const EXPORT_FLAGS: u16 = NBD_FLAG_HAS_FLAGS
    | NBD_FLAG_SEND_FLUSH
    | NBD_FLAG_SEND_FUA
    | NBD_FLAG_ROTATIONAL
    | NBD_FLAG_SEND_TRIM;

/// Export flags carried in the old-style handshake (a 32-bit field there).
const OLD_EXPORT_FLAGS: u32 =
    (NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_FUA | NBD_FLAG_SEND_TRIM) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    HandshakeSent,
    ZeroReceived,
    OptionNegotiating,
    DataPushing,
    Disconnected,
}

/// One accepted connection: protocol state, receive buffer, and counters.
/// Never shared across connections.
pub struct Client {
    state: ClientState,
    export: Arc<Export>,
    queue: WriteQueue,
    rx: BytesMut,
    write_count: u64,
    write_bytes: u64,
}

impl Client {
    /// Create a connection in the fixed-newstyle flow, appending the
    /// handshake greeting to `out`.
    pub fn new_style(export: Arc<Export>, queue: WriteQueue, out: &mut BytesMut) -> Self {
        encode_new_handshake(NBD_FLAG_FIXED_NEWSTYLE, out);
        Self::with_state(export, queue, ClientState::HandshakeSent)
    }

    /// Create a connection in the legacy flow: the full old-style handshake
    /// goes out unilaterally and the command phase begins at once.
    pub fn old_style(export: Arc<Export>, queue: WriteQueue, out: &mut BytesMut) -> Self {
        encode_old_handshake(export.size(), OLD_EXPORT_FLAGS, out);
        Self::with_state(export, queue, ClientState::DataPushing)
    }

    fn with_state(export: Arc<Export>, queue: WriteQueue, state: ClientState) -> Self {
        Self {
            state,
            export,
            queue,
            rx: BytesMut::new(),
            write_count: 0,
            write_bytes: 0,
        }
    }

    /// The receive buffer the driver appends network bytes to.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.rx
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ClientState::Disconnected
    }

    /// (writes issued, cumulative bytes written) on this connection.
    pub fn counters(&self) -> (u64, u64) {
        (self.write_count, self.write_bytes)
    }

    /// Drain all complete buffered messages, appending responses to `out`.
    /// Returns as soon as a decode signals "need more data" or the
    /// connection reaches `Disconnected`.
    pub fn advance(&mut self, out: &mut BytesMut) {
        while !self.rx.is_empty() {
            let progressed = match self.state {
                ClientState::HandshakeSent => self.take_zero_ack(),
                ClientState::ZeroReceived | ClientState::OptionNegotiating => self.take_option(out),
                ClientState::DataPushing => self.take_request(out),
                ClientState::Disconnected => return,
            };
            if !progressed {
                return;
            }
        }
    }

    fn disconnect(&mut self) {
        self.state = ClientState::Disconnected;
    }

    fn take_zero_ack(&mut self) -> bool {
        match decode_zero_ack(&mut self.rx) {
            Ok(None) => false,
            Ok(Some(())) => {
                self.state = ClientState::ZeroReceived;
                true
            }
            Err(err) => {
                // No reply is owed to a client that rejected fixed newstyle.
                debug!(error = %err, "handshake rejected");
                self.disconnect();
                true
            }
        }
    }

    fn take_option(&mut self, out: &mut BytesMut) -> bool {
        let option = match decode_option_request(&mut self.rx) {
            Ok(None) => return false,
            Ok(Some(option)) => option,
            Err(err) => {
                warn!(error = %err, "option negotiation protocol violation");
                self.disconnect();
                return true;
            }
        };

        match option {
            OptionRequest::ExportName(name) => {
                if name == self.export.name() {
                    encode_export_info(self.export.size(), EXPORT_FLAGS, out);
                    self.state = ClientState::DataPushing;
                } else {
                    debug!("export name mismatch");
                    self.disconnect();
                }
            }
            OptionRequest::Abort => {
                debug!("client aborted negotiation");
                self.disconnect();
            }
            OptionRequest::List | OptionRequest::Unknown { .. } => {
                encode_option_reply(option.code(), NBD_REP_ERR_UNSUP, &[], out);
                self.state = ClientState::OptionNegotiating;
            }
        }
        true
    }

    fn take_request(&mut self, out: &mut BytesMut) -> bool {
        let request = match decode_request(&mut self.rx) {
            Ok(None) => return false,
            Ok(Some(request)) => request,
            Err(err) => {
                warn!(error = %err, "command protocol violation, disconnecting");
                self.disconnect();
                return true;
            }
        };
        self.dispatch(request, out);
        true
    }

    fn dispatch(&mut self, request: Request, out: &mut BytesMut) {
        let Request {
            handle,
            offset,
            length,
            command,
        } = request;

        match command {
            Command::Read => {
                if !self.export.store().contains(offset, length as u64) {
                    encode_reply(handle, NBD_EINVAL, out);
                    return;
                }
                match self.export.store().read(offset, length) {
                    Ok(data) => {
                        encode_reply(handle, NBD_OK, out);
                        out.extend_from_slice(&data);
                    }
                    Err(err) => {
                        warn!(offset, length, error = %err, "read failed");
                        encode_reply(handle, nbd_errno(&err), out);
                    }
                }
            }
            Command::Write(data) => {
                if !self.export.store().contains(offset, length as u64) {
                    encode_reply(handle, NBD_EINVAL, out);
                    return;
                }
                match self.export.store().write(offset, &data) {
                    Ok(()) => {
                        self.write_count += 1;
                        self.write_bytes += data.len() as u64;
                        debug!(
                            writes = self.write_count,
                            cumulative_bytes = self.write_bytes,
                            size = data.len(),
                            "write"
                        );
                        // Best effort: a dropped publish never fails the
                        // write back to the client.
                        self.queue.publish(offset / SECTOR_SIZE, data);
                        encode_reply(handle, NBD_OK, out);
                    }
                    Err(err) => {
                        warn!(offset, length, error = %err, "write failed");
                        encode_reply(handle, nbd_errno(&err), out);
                    }
                }
            }
            Command::Disconnect => {
                debug!("client requested disconnect");
                self.disconnect();
            }
            Command::Flush => match self.export.store().flush() {
                Ok(()) => encode_reply(handle, NBD_OK, out),
                Err(err) => {
                    warn!(error = %err, "flush failed");
                    encode_reply(handle, nbd_errno(&err), out);
                }
            },
            Command::Trim => {
                if !self.export.store().contains(offset, length as u64) {
                    encode_reply(handle, NBD_EINVAL, out);
                    return;
                }
                match self.export.store().trim(offset, length as u64) {
                    Ok(()) => encode_reply(handle, NBD_OK, out),
                    Err(err) => {
                        warn!(offset, length, error = %err, "trim failed");
                        encode_reply(handle, nbd_errno(&err), out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BackingStore;
    use bytes::Bytes;
    use nbd_wire::{
        NBD_CMD_DISCONNECT, NBD_CMD_READ, NBD_CMD_WRITE, NBD_OPTS_MAGIC, NBD_OPT_ABORT,
        NBD_OPT_EXPORT_NAME, NBD_OPT_LIST, NBD_REPLY_MAGIC, NBD_REQUEST_MAGIC, EXPORT_INFO_BYTES,
        NEW_HANDSHAKE_BYTES, OPTION_REPLY_BYTES, REPLY_BYTES,
    };

    const EXPORT_SIZE: u64 = 1 << 20;

    fn test_export() -> (tempfile::NamedTempFile, Arc<Export>) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = BackingStore::open(file.path(), EXPORT_SIZE).unwrap();
        (file, Arc::new(Export::new(&b"disk0"[..], store)))
    }

    fn negotiated_client() -> (tempfile::NamedTempFile, Client) {
        let (file, export) = test_export();
        let mut out = BytesMut::new();
        let mut client = Client::new_style(export, WriteQueue::disabled(), &mut out);
        out.clear();

        feed(&mut client, &[0u8; 4], &mut out);
        feed(&mut client, &option_bytes(NBD_OPT_EXPORT_NAME, b"disk0"), &mut out);
        assert_eq!(client.state(), ClientState::DataPushing);
        (file, client)
    }

    fn feed(client: &mut Client, bytes: &[u8], out: &mut BytesMut) {
        client.buffer_mut().extend_from_slice(bytes);
        client.advance(out);
    }

    fn option_bytes(code: u32, data: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        raw.extend_from_slice(&code.to_be_bytes());
        raw.extend_from_slice(&(data.len() as u32).to_be_bytes());
        raw.extend_from_slice(data);
        raw
    }

    fn request_bytes(code: u32, handle: u64, offset: u64, length: u32, payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        raw.extend_from_slice(&code.to_be_bytes());
        raw.extend_from_slice(&handle.to_be_bytes());
        raw.extend_from_slice(&offset.to_be_bytes());
        raw.extend_from_slice(&length.to_be_bytes());
        raw.extend_from_slice(payload);
        raw
    }

    fn reply_fields(out: &[u8]) -> (u32, u64) {
        assert_eq!(
            u32::from_be_bytes(out[0..4].try_into().unwrap()),
            NBD_REPLY_MAGIC
        );
        let error = u32::from_be_bytes(out[4..8].try_into().unwrap());
        let handle = u64::from_be_bytes(out[8..16].try_into().unwrap());
        (error, handle)
    }

    #[test]
    fn new_style_emits_greeting() {
        let (_f, export) = test_export();
        let mut out = BytesMut::new();
        let client = Client::new_style(export, WriteQueue::disabled(), &mut out);
        assert_eq!(out.len(), NEW_HANDSHAKE_BYTES);
        assert_eq!(client.state(), ClientState::HandshakeSent);
    }

    #[test]
    fn nonzero_ack_disconnects_without_reply() {
        let (_f, export) = test_export();
        let mut out = BytesMut::new();
        let mut client = Client::new_style(export, WriteQueue::disabled(), &mut out);
        out.clear();

        feed(&mut client, &1u32.to_be_bytes(), &mut out);
        assert!(client.is_disconnected());
        assert!(out.is_empty());
    }

    #[test]
    fn export_name_match_reaches_data_pushing() {
        let (_f, export) = test_export();
        let mut out = BytesMut::new();
        let mut client = Client::new_style(export, WriteQueue::disabled(), &mut out);
        out.clear();

        feed(&mut client, &[0u8; 4], &mut out);
        assert_eq!(client.state(), ClientState::ZeroReceived);
        assert!(out.is_empty());

        feed(&mut client, &option_bytes(NBD_OPT_EXPORT_NAME, b"disk0"), &mut out);
        assert_eq!(client.state(), ClientState::DataPushing);
        assert_eq!(out.len(), EXPORT_INFO_BYTES);
        assert_eq!(u64::from_be_bytes(out[0..8].try_into().unwrap()), EXPORT_SIZE);
    }

    #[test]
    fn export_name_mismatch_disconnects() {
        let (_f, export) = test_export();
        let mut out = BytesMut::new();
        let mut client = Client::new_style(export, WriteQueue::disabled(), &mut out);
        out.clear();

        feed(&mut client, &[0u8; 4], &mut out);
        feed(&mut client, &option_bytes(NBD_OPT_EXPORT_NAME, b"other"), &mut out);
        assert!(client.is_disconnected());
        assert!(out.is_empty());
    }

    #[test]
    fn abort_disconnects() {
        let (_f, export) = test_export();
        let mut out = BytesMut::new();
        let mut client = Client::new_style(export, WriteQueue::disabled(), &mut out);
        out.clear();

        feed(&mut client, &[0u8; 4], &mut out);
        feed(&mut client, &option_bytes(NBD_OPT_ABORT, &[]), &mut out);
        assert!(client.is_disconnected());
    }

    #[test]
    fn unsupported_option_gets_error_reply_then_negotiation_continues() {
        let (_f, export) = test_export();
        let mut out = BytesMut::new();
        let mut client = Client::new_style(export, WriteQueue::disabled(), &mut out);
        out.clear();

        feed(&mut client, &[0u8; 4], &mut out);
        feed(&mut client, &option_bytes(NBD_OPT_LIST, &[]), &mut out);
        assert_eq!(client.state(), ClientState::OptionNegotiating);
        assert_eq!(out.len(), OPTION_REPLY_BYTES);

        out.clear();
        feed(&mut client, &option_bytes(NBD_OPT_EXPORT_NAME, b"disk0"), &mut out);
        assert_eq!(client.state(), ClientState::DataPushing);
    }

    #[test]
    fn old_style_starts_in_data_pushing() {
        let (_f, export) = test_export();
        let mut out = BytesMut::new();
        let client = Client::old_style(export, WriteQueue::disabled(), &mut out);
        assert_eq!(out.len(), nbd_wire::OLD_HANDSHAKE_BYTES);
        assert_eq!(client.state(), ClientState::DataPushing);
    }

    #[test]
    fn read_after_write_returns_written_bytes() {
        let (_f, mut client) = negotiated_client();
        let mut out = BytesMut::new();

        let payload = vec![0x5a; 512];
        feed(
            &mut client,
            &request_bytes(NBD_CMD_WRITE, 10, 0, 512, &payload),
            &mut out,
        );
        let (error, handle) = reply_fields(&out);
        assert_eq!((error, handle), (0, 10));
        assert_eq!(out.len(), REPLY_BYTES);

        out.clear();
        feed(&mut client, &request_bytes(NBD_CMD_READ, 11, 0, 512, &[]), &mut out);
        let (error, handle) = reply_fields(&out);
        assert_eq!((error, handle), (0, 11));
        assert_eq!(&out[REPLY_BYTES..], &payload[..]);
    }

    #[test]
    fn replies_echo_handles_across_interleaved_commands() {
        let (_f, mut client) = negotiated_client();
        let mut out = BytesMut::new();

        let mut stream = Vec::new();
        for handle in [3u64, 9, 27, 81] {
            if handle % 2 == 1 {
                stream.extend_from_slice(&request_bytes(
                    NBD_CMD_WRITE,
                    handle,
                    0,
                    8,
                    &[handle as u8; 8],
                ));
            } else {
                stream.extend_from_slice(&request_bytes(NBD_CMD_READ, handle, 0, 8, &[]));
            }
        }
        feed(&mut client, &stream, &mut out);

        let mut cursor = &out[..];
        for handle in [3u64, 9, 27, 81] {
            let (error, echoed) = reply_fields(cursor);
            assert_eq!(error, 0);
            assert_eq!(echoed, handle);
            let advance = if handle % 2 == 1 {
                REPLY_BYTES
            } else {
                REPLY_BYTES + 8
            };
            cursor = &cursor[advance..];
        }
        assert!(cursor.is_empty());
    }

    #[test]
    fn write_held_until_full_payload_arrives() {
        let (_f, mut client) = negotiated_client();
        let mut out = BytesMut::new();

        let raw = request_bytes(NBD_CMD_WRITE, 1, 0, 512, &[0xcc; 512]);
        for chunk in raw[..raw.len() - 1].chunks(13) {
            feed(&mut client, chunk, &mut out);
            assert!(out.is_empty());
        }
        feed(&mut client, &raw[raw.len() - 1..], &mut out);
        let (error, handle) = reply_fields(&out);
        assert_eq!((error, handle), (0, 1));
    }

    #[test]
    fn out_of_range_read_gets_einval_reply() {
        let (_f, mut client) = negotiated_client();
        let mut out = BytesMut::new();

        feed(
            &mut client,
            &request_bytes(NBD_CMD_READ, 5, EXPORT_SIZE, 512, &[]),
            &mut out,
        );
        let (error, handle) = reply_fields(&out);
        assert_eq!((error, handle), (NBD_EINVAL, 5));
        assert_eq!(out.len(), REPLY_BYTES);
        assert!(!client.is_disconnected());
    }

    #[test]
    fn bad_request_magic_disconnects_without_reply() {
        let (_f, mut client) = negotiated_client();
        let mut out = BytesMut::new();

        let mut raw = request_bytes(NBD_CMD_READ, 1, 0, 0, &[]);
        raw[0] ^= 0xff;
        feed(&mut client, &raw, &mut out);
        assert!(client.is_disconnected());
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_command_disconnects() {
        let (_f, mut client) = negotiated_client();
        let mut out = BytesMut::new();

        feed(&mut client, &request_bytes(99, 1, 0, 0, &[]), &mut out);
        assert!(client.is_disconnected());
        assert!(out.is_empty());
    }

    #[test]
    fn disconnect_command_sends_no_reply() {
        let (_f, mut client) = negotiated_client();
        let mut out = BytesMut::new();

        feed(
            &mut client,
            &request_bytes(NBD_CMD_DISCONNECT, 1, 0, 0, &[]),
            &mut out,
        );
        assert!(client.is_disconnected());
        assert!(out.is_empty());
    }

    #[test]
    fn writes_publish_sector_and_payload() {
        let (_file, export) = test_export();
        let (queue, mut published) = WriteQueue::channel_for_test();
        let mut out = BytesMut::new();
        let mut client = Client::old_style(export, queue, &mut out);
        out.clear();

        let payload = vec![0x42; 1024];
        feed(
            &mut client,
            &request_bytes(NBD_CMD_WRITE, 1, 3 * 512, 1024, &payload),
            &mut out,
        );
        let (error, _) = reply_fields(&out);
        assert_eq!(error, 0);

        let (sector, data) = published.try_recv().unwrap();
        assert_eq!(sector, 3);
        assert_eq!(data, Bytes::from(payload));
        assert_eq!(client.counters(), (1, 1024));
    }

    #[test]
    fn publish_failure_still_succeeds_for_client() {
        let (_file, export) = test_export();
        let (queue, published) = WriteQueue::channel_for_test();
        drop(published); // worker gone: every publish drops
        let mut out = BytesMut::new();
        let mut client = Client::old_style(export, queue, &mut out);
        out.clear();

        feed(
            &mut client,
            &request_bytes(NBD_CMD_WRITE, 8, 0, 16, &[1; 16]),
            &mut out,
        );
        let (error, handle) = reply_fields(&out);
        assert_eq!((error, handle), (0, 8));
    }
}
