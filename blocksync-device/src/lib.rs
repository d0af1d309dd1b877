//! Blocking metadata-store abstraction used by the activity log and resync
//! tracker in `blocksync-core`.
//!
//! Metadata I/O in this system is always a synchronous, blocking, aligned
//! 4 KiB operation issued from a worker or application thread (never from
//! an async task) with explicit flush/FUA semantics on writes, so the trait
//! here is deliberately blocking rather than `async fn` based.
//!
//! # Example
//!
//! ```
//! use blocksync_device::{InMemoryStore, MetadataStore, BLOCK_SIZE};
//!
//! let mut store = InMemoryStore::new(16);
//! let block = [0xAB; BLOCK_SIZE];
//! store.write_block(3, &block, true).unwrap();
//!
//! let mut out = [0u8; BLOCK_SIZE];
//! store.read_block(3, &mut out).unwrap();
//! assert_eq!(out, block);
//! ```

#![warn(missing_docs)]

use std::fmt;
use std::io;

/// Size in bytes of a single metadata block. All metadata I/O in this system
/// is aligned to exactly this granularity.
pub const BLOCK_SIZE: usize = 4096;

/// A 4 KiB metadata block buffer.
pub type Block = [u8; BLOCK_SIZE];

/// Errors a [`MetadataStore`] implementation can report.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying I/O operation failed.
    #[error("metadata I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The requested sector lies outside the backing device.
    #[error("sector {sector} out of range (device has {sectors} sectors)")]
    OutOfRange {
        /// The sector that was requested.
        sector: u64,
        /// The device's sector count.
        sectors: u64,
    },
}

/// A blocking store for fixed-size 4 KiB metadata blocks, addressed by
/// 512-byte sector number (the block occupies 8 consecutive sectors).
///
/// Implementors need not provide their own alignment or caching: the
/// metadata I/O gate in `blocksync-core` serializes all access to a single
/// shared buffer and is the only caller of this trait.
pub trait MetadataStore: Send {
    /// Read one 4 KiB block starting at `sector`.
    fn read_block(&mut self, sector: u64, buf: &mut Block) -> Result<(), StoreError>;

    /// Write one 4 KiB block starting at `sector`.
    ///
    /// When `flush` is set the implementation must ensure the write is
    /// durable (FLUSH|FUA semantics) before returning; when clear the
    /// write may be buffered.
    fn write_block(&mut self, sector: u64, buf: &Block, flush: bool) -> Result<(), StoreError>;

    /// Total number of 512-byte sectors addressable on this store.
    fn size_sectors(&self) -> u64;

    /// Whether `sector` is a valid start-of-block sector on this store.
    fn check_range(&self, sector: u64) -> Result<(), StoreError> {
        let sectors = self.size_sectors();
        if sector + 8 > sectors {
            return Err(StoreError::OutOfRange { sector, sectors });
        }
        Ok(())
    }
}

/// An in-memory [`MetadataStore`] backed by a `Vec<u8>`, used in unit tests
/// and as a crash-free reference implementation.
pub struct InMemoryStore {
    data: Vec<u8>,
    sync_count: u64,
}

impl InMemoryStore {
    /// Create a store with room for `block_count` 4 KiB blocks.
    pub fn new(block_count: u64) -> Self {
        Self {
            data: vec![0u8; block_count as usize * BLOCK_SIZE],
            sync_count: 0,
        }
    }

    /// Number of times a flushed write has been issued against this store.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("blocks", &(self.data.len() / BLOCK_SIZE))
            .field("sync_count", &self.sync_count)
            .finish()
    }
}

impl MetadataStore for InMemoryStore {
    fn read_block(&mut self, sector: u64, buf: &mut Block) -> Result<(), StoreError> {
        self.check_range(sector)?;
        let offset = (sector as usize / 8) * BLOCK_SIZE;
        buf.copy_from_slice(&self.data[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, sector: u64, buf: &Block, flush: bool) -> Result<(), StoreError> {
        self.check_range(sector)?;
        let offset = (sector as usize / 8) * BLOCK_SIZE;
        self.data[offset..offset + BLOCK_SIZE].copy_from_slice(buf);
        if flush {
            self.sync_count += 1;
        }
        Ok(())
    }

    fn size_sectors(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE) as u64 * 8
    }
}

/// A [`MetadataStore`] backed by a regular file, using `sync_data` to
/// emulate FLUSH|FUA semantics on writes that request durability.
pub struct FileStore {
    file: std::fs::File,
    sectors: u64,
}

impl FileStore {
    /// Open (or create) `path` as a metadata store with room for
    /// `block_count` 4 KiB blocks, truncating/extending as needed.
    pub fn open(path: &std::path::Path, block_count: u64) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = block_count * BLOCK_SIZE as u64;
        file.set_len(len)?;
        Ok(Self {
            file,
            sectors: block_count * 8,
        })
    }
}

impl MetadataStore for FileStore {
    fn read_block(&mut self, sector: u64, buf: &mut Block) -> Result<(), StoreError> {
        use std::io::{Read, Seek, SeekFrom};
        self.check_range(sector)?;
        self.file.seek(SeekFrom::Start(sector * 512))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, sector: u64, buf: &Block, flush: bool) -> Result<(), StoreError> {
        use std::io::{Seek, SeekFrom, Write};
        self.check_range(sector)?;
        self.file.seek(SeekFrom::Start(sector * 512))?;
        self.file.write_all(buf)?;
        if flush {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn size_sectors(&self) -> u64 {
        self.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_round_trip() {
        let mut store = InMemoryStore::new(4);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0x42;
        store.write_block(16, &block, true).unwrap();
        assert_eq!(store.sync_count(), 1);

        let mut out = [0u8; BLOCK_SIZE];
        store.read_block(16, &mut out).unwrap();
        assert_eq!(out[0], 0x42);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut store = InMemoryStore::new(1);
        let block = [0u8; BLOCK_SIZE];
        let err = store.write_block(8, &block, false).unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange { .. }));
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.img");
        let mut store = FileStore::open(&path, 4).unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        block[10] = 7;
        store.write_block(0, &block, true).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        store.read_block(0, &mut out).unwrap();
        assert_eq!(out[10], 7);
    }
}
