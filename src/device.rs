//! Block device adaptor.
//!
//! The rest of the crate never touches a storage backend directly — it
//! only ever talks to a `BlockDevice`. This is the same "opaque `struct
//! block *`" boundary the Pintos filesystem this crate models is built on:
//! the IDE disk, a RAM disk, and a virtio queue are all interchangeable
//! behind it, and so are `MemoryDevice` and `FileBackedDevice` here.
//!
//! Errors are fatal: a device that can't satisfy a read or write has
//! nothing sensible left to do, so both implementations panic rather than
//! returning a typed error. There are no reordering guarantees between
//! sectors; callers that need ordering get it from the buffer cache's
//! locking, not from the device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::trace;

use crate::layout::{SectorIndex, SECTOR_SIZE};

/// Byte-addressable sector I/O over an underlying device, plus a
/// monotonically increasing write counter so tests can observe how many
/// sector writes actually reached the backing store (used by the
/// coalescing scenario in spec's testable properties).
pub trait BlockDevice: Send + Sync {
    /// Fills `buf` with the contents of `sector`. Panics on I/O failure or
    /// if `sector` is out of range.
    fn read(&self, sector: SectorIndex, buf: &mut [u8; SECTOR_SIZE]);

    /// Persists `buf` as the contents of `sector` and increments the write
    /// counter. Panics on I/O failure or if `sector` is out of range.
    fn write(&self, sector: SectorIndex, buf: &[u8; SECTOR_SIZE]);

    /// Number of sectors this device exposes.
    fn num_sectors(&self) -> u32;

    /// Number of `write` calls that have completed since construction.
    fn write_count(&self) -> u64;
}

/// An in-memory device, useful for tests and for experimenting without
/// leaving a file behind. Every sector starts zeroed.
pub struct MemoryDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    writes: AtomicU64,
}

impl MemoryDevice {
    /// Creates a device with `num_sectors` zeroed sectors.
    pub fn new(num_sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; num_sectors]),
            writes: AtomicU64::new(0),
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn read(&self, sector: SectorIndex, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock().unwrap();
        let src = sectors
            .get(sector as usize)
            .unwrap_or_else(|| panic!("read past end of device: sector {sector}"));
        buf.copy_from_slice(src);
    }

    fn write(&self, sector: SectorIndex, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock().unwrap();
        let dst = sectors
            .get_mut(sector as usize)
            .unwrap_or_else(|| panic!("write past end of device: sector {sector}"));
        dst.copy_from_slice(buf);
        drop(sectors);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn num_sectors(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// A device backed by a single file on the host filesystem, for a durable
/// on-disk image between runs. The file is extended (sparsely) to
/// `num_sectors * SECTOR_SIZE` bytes at construction time.
pub struct FileBackedDevice {
    file: Mutex<File>,
    num_sectors: u32,
    writes: AtomicU64,
}

impl FileBackedDevice {
    /// Opens (creating if necessary) `path` as a disk image of
    /// `num_sectors` sectors.
    pub fn open(path: impl AsRef<Path>, num_sectors: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(num_sectors as u64 * SECTOR_SIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            num_sectors,
            writes: AtomicU64::new(0),
        })
    }
}

impl BlockDevice for FileBackedDevice {
    fn read(&self, sector: SectorIndex, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.num_sectors, "read past end of device: sector {sector}");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .and_then(|_| file.read_exact(buf))
            .unwrap_or_else(|e| panic!("device read failed at sector {sector}: {e}"));
    }

    fn write(&self, sector: SectorIndex, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < self.num_sectors, "write past end of device: sector {sector}");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .and_then(|_| file.write_all(buf))
            .unwrap_or_else(|e| panic!("device write failed at sector {sector}: {e}"));
        drop(file);
        trace!("sector {sector} written to disk image");
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
