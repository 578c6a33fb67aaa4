//! Write-queue publisher.
//!
//! Every successful NBD write is published, best-effort, as an ordered pair
//! (sector index, payload) onto an external Redis-style list so an offline
//! consumer can replay the write stream. The publisher is process-wide
//! shared state: one [`WriteQueue`] handle is cloned into every connection,
//! and a single [`QueueWorker`] task owns the queue connection and drains
//! the channel between them.
//!
//! `publish` never blocks the event loop. When the channel is full or the
//! worker is gone, the write is dropped from the queue (the client-visible
//! write still succeeds); queue delivery is not part of the write's
//! durability contract.
//!
//! The worker reconnects transparently on the EOF/reset disconnect class a
//! queue server produces when it times out an idle connection, reselecting
//! the same database index. Any other failure is fatal to the process.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::QueueError;

/// List key the pairs are pushed onto.
pub const QUEUE_KEY: &[u8] = b"writequeue";

/// Pairs buffered between the connections and the worker before publishes
/// start getting dropped.
const PUBLISH_CAPACITY: usize = 1024;

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Enqueued,
    Dropped,
}

/// Cloneable, non-blocking handle to the queue worker.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: Option<mpsc::Sender<(u64, Bytes)>>,
}

impl WriteQueue {
    /// Create a connected publisher. The returned worker must be spawned;
    /// it performs the actual connect and serves all handles.
    pub fn connect(address: String, db: u32) -> (Self, QueueWorker) {
        let (tx, rx) = mpsc::channel(PUBLISH_CAPACITY);
        (Self { tx: Some(tx) }, QueueWorker { address, db, rx })
    }

    /// A publisher with no queue behind it; every publish reports `Dropped`
    /// silently. Used when no queue is configured.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Hand one (sector, payload) pair to the worker without blocking.
    pub fn publish(&self, sector: u64, payload: Bytes) -> Publish {
        let Some(tx) = &self.tx else {
            return Publish::Dropped;
        };
        match tx.try_send((sector, payload)) {
            Ok(()) => Publish::Enqueued,
            Err(err) => {
                warn!(sector, error = %err, "write queue unavailable, dropping published write");
                Publish::Dropped
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn channel_for_test() -> (Self, mpsc::Receiver<(u64, Bytes)>) {
        let (tx, rx) = mpsc::channel(PUBLISH_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }
}

/// Owns the TCP connection to the queue server and drains published pairs.
#[derive(Debug)]
pub struct QueueWorker {
    address: String,
    db: u32,
    rx: mpsc::Receiver<(u64, Bytes)>,
}

impl QueueWorker {
    /// Run until every `WriteQueue` handle is dropped or a fatal error
    /// occurs. Timeout-class disconnects reconnect in place and retry the
    /// in-flight pair once, resuming at the sub-write whose acknowledgment
    /// never arrived: re-sending an already-acked sector would leave an
    /// unpaired entry in the list and desynchronize every pair after it.
    pub async fn run(mut self) -> Result<(), QueueError> {
        let mut conn = QueueConn::open(&self.address, self.db).await?;
        info!(address = %self.address, db = self.db, "write queue connected");

        while let Some((sector, payload)) = self.rx.recv().await {
            if let Err((stage, err)) = conn.push_pair(sector, &payload, PairStage::Sector).await {
                if !err.is_timeout_class() {
                    return Err(err);
                }
                warn!(error = %err, ?stage, "write queue disconnected, reconnecting");
                conn = QueueConn::open(&self.address, self.db).await?;
                info!(address = %self.address, db = self.db, "write queue reconnected");
                if let Err((_, err)) = conn.push_pair(sector, &payload, stage).await {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Progress marker within a published pair's two sub-writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairStage {
    Sector,
    Payload,
}

struct QueueConn {
    stream: TcpStream,
    rx: BytesMut,
}

impl QueueConn {
    async fn open(address: &str, db: u32) -> Result<Self, QueueError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(QueueError::Connect)?;
        let mut conn = Self {
            stream,
            rx: BytesMut::new(),
        };
        // Bind the logical namespace before anything is pushed.
        conn.command(&[b"SELECT", db.to_string().as_bytes()])
            .await?;
        Ok(conn)
    }

    /// Two ordered sub-writes per published pair: sector index first, then
    /// the raw payload, so the consumer can reconstruct pairs in order.
    ///
    /// Starts at `from`, and on failure reports the stage whose ack was not
    /// received, so the caller can reconnect and resume without duplicating
    /// an acked sub-write.
    async fn push_pair(
        &mut self,
        sector: u64,
        payload: &[u8],
        from: PairStage,
    ) -> Result<(), (PairStage, QueueError)> {
        if from == PairStage::Sector {
            self.command(&[b"LPUSH", QUEUE_KEY, &sector.to_be_bytes()])
                .await
                .map_err(|err| (PairStage::Sector, err))?;
        }
        self.command(&[b"LPUSH", QUEUE_KEY, payload])
            .await
            .map_err(|err| (PairStage::Payload, err))?;
        Ok(())
    }

    async fn command(&mut self, parts: &[&[u8]]) -> Result<resp::Reply, QueueError> {
        let mut out = BytesMut::new();
        resp::encode_command(parts, &mut out);
        self.stream.write_all(&out).await?;

        loop {
            if let Some(reply) = resp::decode_reply(&mut self.rx)? {
                return match reply {
                    resp::Reply::Error(message) => Err(QueueError::Server(message)),
                    other => Ok(other),
                };
            }
            let n = self.stream.read_buf(&mut self.rx).await?;
            if n == 0 {
                return Err(QueueError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
        }
    }
}

/// Minimal RESP framing: command arrays out, simple-string/integer/error
/// replies back. Same incremental contract as the NBD codec: `Ok(None)`
/// means a complete reply is not buffered yet.
pub(crate) mod resp {
    use bytes::{Buf, BufMut, BytesMut};

    use crate::error::QueueError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Reply {
        Simple(String),
        Integer(i64),
        Error(String),
    }

    pub fn encode_command(parts: &[&[u8]], out: &mut BytesMut) {
        out.put_slice(format!("*{}\r\n", parts.len()).as_bytes());
        for part in parts {
            out.put_slice(format!("${}\r\n", part.len()).as_bytes());
            out.put_slice(part);
            out.put_slice(b"\r\n");
        }
    }

    pub fn decode_reply(buf: &mut BytesMut) -> Result<Option<Reply>, QueueError> {
        let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        if end == 0 {
            return Err(QueueError::Protocol("empty reply line"));
        }
        let kind = buf[0];
        let rest = std::str::from_utf8(&buf[1..end])
            .map_err(|_| QueueError::Protocol("reply is not valid utf-8"))?;

        let reply = match kind {
            b'+' => Reply::Simple(rest.to_string()),
            b'-' => Reply::Error(rest.to_string()),
            b':' => Reply::Integer(
                rest.parse()
                    .map_err(|_| QueueError::Protocol("malformed integer reply"))?,
            ),
            _ => return Err(QueueError::Protocol("unexpected reply type")),
        };
        buf.advance(end + 2);
        Ok(Some(reply))
    }

}
