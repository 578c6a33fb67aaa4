//! Backing store: a single fixed-size byte extent over a file or block
//! device.
//!
//! I/O is issued synchronously. On a single-threaded event loop this blocks
//! everything for the duration of the call, which is the accepted trade-off
//! here (simplicity over tail latency).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::{Bytes, BytesMut};

use nbd_wire::NBD_EIO;

/// Addressing unit for published writes, independent of the backing store's
/// physical block size.
pub const SECTOR_SIZE: u64 = 512;

/// Size reported for exports whose backing file is empty and whose declared
/// size is zero. Large enough to look like a real device to any client;
/// bounded by the maximum file offset.
pub const SYNTHETIC_EXPORT_SIZE: u64 = i64::MAX as u64;

/// Random-access read/write/flush/deallocate over one open file.
#[derive(Debug)]
pub struct BackingStore {
    file: File,
    size: u64,
}

impl BackingStore {
    /// Open the backing file and fix the export size for the process
    /// lifetime.
    ///
    /// A non-zero `declared_size` wins; otherwise the file's own size is
    /// used, and an empty file gets [`SYNTHETIC_EXPORT_SIZE`] so sparse or
    /// null-like backing files can still be exported.
    pub fn open(path: &Path, declared_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = match declared_size {
            0 => match file.metadata()?.len() {
                0 => SYNTHETIC_EXPORT_SIZE,
                len => len,
            },
            declared => declared,
        };
        Ok(Self { file, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when `[offset, offset + length)` lies within the extent.
    pub fn contains(&self, offset: u64, length: u64) -> bool {
        offset
            .checked_add(length)
            .map(|end| end <= self.size)
            .unwrap_or(false)
    }

    /// Read exactly `length` bytes at `offset`.
    ///
    /// Bytes past the backing file's physical end read as zeroes, so a
    /// declared size larger than the file behaves like a sparse device.
    pub fn read(&self, offset: u64, length: u32) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(length as usize);
        let mut pos = 0usize;
        while pos < buf.len() {
            match self.file.read_at(&mut buf[pos..], offset + pos as u64)? {
                0 => break, // past EOF; remainder stays zero
                n => pos += n,
            }
        }
        Ok(buf.freeze())
    }

    /// Write all of `data` at `offset`, extending the file if needed.
    pub fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// fsync the backing file.
    pub fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Deallocate (punch a hole over) `[offset, offset + length)`.
    #[cfg(target_os = "linux")]
    pub fn trim(&self, offset: u64, length: u64) -> io::Result<()> {
        use nix::fcntl::{fallocate, FallocateFlags};
        use std::os::fd::AsRawFd;

        fallocate(
            self.file.as_raw_fd(),
            FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset as i64,
            length as i64,
        )
        .map_err(io::Error::from)
    }

    /// Trim is advisory; without hole punching it is a no-op.
    #[cfg(not(target_os = "linux"))]
    pub fn trim(&self, _offset: u64, _length: u64) -> io::Result<()> {
        Ok(())
    }
}

/// The named, sized byte extent this server offers. Immutable for the
/// process lifetime and shared by every connection.
#[derive(Debug)]
pub struct Export {
    name: Bytes,
    store: BackingStore,
}

impl Export {
    pub fn new(name: impl Into<Bytes>, store: BackingStore) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.store.size()
    }

    pub fn store(&self) -> &BackingStore {
        &self.store
    }
}

/// Map an I/O failure to the OS-style errno value carried in an NBD reply.
pub fn nbd_errno(err: &io::Error) -> u32 {
    err.raw_os_error().map(|code| code as u32).unwrap_or(NBD_EIO)
}
