//! shadowblk: NBD export server that shadows writes into an external queue.
//!
//! One process serves a single named export backed by a raw file or block
//! device. Every successful write is additionally published, best-effort,
//! as a (sector, payload) pair onto an external Redis-style list for offline
//! analysis by a downstream consumer.
//!
//! The protocol types and incremental codec live in the `nbd-wire` crate;
//! this crate adds the per-connection state machine, the backing store, the
//! queue publisher, and the daemon that ties them together.

pub mod config;
pub mod conn;
pub mod daemon;
pub mod error;
pub mod listener;
pub mod queue;
pub mod store;

pub use config::{Config, ExportConfig, NbdConfig, QueueConfig};
pub use conn::{Client, ClientState};
pub use daemon::Daemon;
pub use error::{ConfigError, Error, QueueError, Result, WireError};
pub use listener::{Listener, StreamListener};
pub use queue::{Publish, QueueWorker, WriteQueue};
pub use store::{BackingStore, Export, SECTOR_SIZE, SYNTHETIC_EXPORT_SIZE};

pub use nbd_wire;
