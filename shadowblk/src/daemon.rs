//! Daemon bootstrap: open the export, wire up the publisher, accept and
//! drive connections.
//!
//! One event loop drives everything; connection tasks are spawned onto the
//! same current-thread runtime, so only one callback runs at a time and no
//! locking is needed anywhere.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conn::Client;
use crate::error::Error;
use crate::listener::Listener;
use crate::queue::{QueueWorker, WriteQueue};
use crate::store::{BackingStore, Export};

/// A running shadowblk instance.
#[derive(Clone)]
pub struct Daemon {
    export: Arc<Export>,
    queue: WriteQueue,
    oldstyle: bool,
}

impl Daemon {
    /// Create a daemon from configuration.
    ///
    /// Opens the backing store (fatal on failure) and sets up the write
    /// queue if one is configured. The returned worker, if any, must be
    /// spawned by the caller; its error is fatal to the process.
    pub fn from_config(config: &Config) -> Result<(Self, Option<QueueWorker>), Error> {
        config.export.validate()?;

        let store = BackingStore::open(&config.export.path, config.export.size_bytes)?;
        let export = Arc::new(Export::new(config.export.name.clone(), store));

        let (queue, worker) = match &config.queue {
            Some(queue_config) => {
                let (queue, worker) =
                    WriteQueue::connect(queue_config.address.clone(), queue_config.db);
                (queue, Some(worker))
            }
            None => (WriteQueue::disabled(), None),
        };

        Ok((
            Self {
                export,
                queue,
                oldstyle: config.nbd.oldstyle,
            },
            worker,
        ))
    }

    pub fn export(&self) -> &Arc<Export> {
        &self.export
    }

    /// Accept connections until the listener closes.
    ///
    /// Each accepted connection gets a fresh state machine and its own
    /// driver task. Accept failures are logged and never affect established
    /// connections.
    pub async fn listen<L>(&self, mut listener: L) -> Result<(), Error>
    where
        L: Listener,
    {
        info!(
            export = %String::from_utf8_lossy(self.export.name()),
            size_bytes = self.export.size(),
            oldstyle = self.oldstyle,
            "NBD server accepting connections"
        );

        while let Some(accepted) = listener.accept().await {
            match accepted {
                Ok(stream) => {
                    let export = Arc::clone(&self.export);
                    let queue = self.queue.clone();
                    let oldstyle = self.oldstyle;
                    tokio::spawn(async move {
                        let mut out = BytesMut::new();
                        let client = if oldstyle {
                            Client::old_style(export, queue, &mut out)
                        } else {
                            Client::new_style(export, queue, &mut out)
                        };
                        match drive(stream, client, out).await {
                            Ok((writes, bytes)) => {
                                debug!(writes, write_bytes = bytes, "connection closed")
                            }
                            Err(err) => debug!(error = %err, "connection lost"),
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                }
            }
        }
        // Source exhausted (StreamListener sender dropped) - clean exit.
        Ok(())
    }
}

/// Drive one connection: flush pending output, read more bytes, feed the
/// state machine, repeat until it disconnects or the peer goes away.
///
/// Returns the connection's write counters for the close log line.
async fn drive<S>(mut stream: S, mut client: Client, mut out: BytesMut) -> io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
        if client.is_disconnected() {
            return Ok(client.counters());
        }
        let n = stream.read_buf(client.buffer_mut()).await?;
        if n == 0 {
            return Ok(client.counters());
        }
        client.advance(&mut out);
    }
}
