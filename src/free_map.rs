//! Free-map: the sector allocator.
//!
//! A single bitmap, one bit per device sector, protected by one lock
//! (`free_map_lock` in the taxonomy). Sectors 0 and 1 are reserved at
//! format time (the free-map's own inode and the root directory) and are
//! never returned by `allocate`.
//!
//! The bitmap lives fully in memory for the lifetime of the mount.
//! Persisting it to disk is a separate, explicit, infrequent operation
//! (`flush`/`load`) that goes through the inode layer's raw sector-walking
//! functions rather than a fully opened `Inode` — opening an inode needs
//! the free-map to already exist, so routing through the open-inode table
//! here would be circular. `format` and `close` are the only two callers
//! of `flush`; `mount` is the only caller of `load`.

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::cache::BufferCache;
use crate::error::{FsError, FsResult};
use crate::inode;
use crate::layout::SectorIndex;

struct FreeMapInner {
    bits: Vec<bool>,
}

/// The sector allocator. One per mounted file system.
pub struct FreeMap {
    inner: Mutex<FreeMapInner>,
}

/// A held lock over the free-map, letting a caller perform several
/// allocate/release calls as one atomic unit (needed by `inode_create`,
/// which must hold the lock across its whole allocation loop so a
/// concurrent caller never observes a partially allocated file).
pub struct FreeMapGuard<'a> {
    inner: MutexGuard<'a, FreeMapInner>,
}

impl FreeMap {
    /// Builds a free-map of `capacity` bits, all clear, with sectors `0`
    /// and `1` pre-reserved (the free-map's own inode and the root
    /// directory, per the fixed layout in `layout.rs`).
    pub fn new(capacity: u32) -> Arc<Self> {
        let mut bits = vec![false; capacity as usize];
        bits[crate::layout::FREE_MAP_SECTOR as usize] = true;
        bits[crate::layout::ROOT_DIR_SECTOR as usize] = true;
        Arc::new(Self {
            inner: Mutex::new(FreeMapInner { bits }),
        })
    }

    /// Acquires the free-map lock for a multi-step operation.
    pub fn lock(&self) -> FreeMapGuard<'_> {
        FreeMapGuard {
            inner: self.inner.lock().unwrap(),
        }
    }

    /// Allocates and returns one clear sector, or `NoSpace`.
    pub fn allocate(&self) -> FsResult<SectorIndex> {
        self.lock().allocate()
    }

    /// Allocates one sector and zero-fills it through `cache`.
    pub fn zero_allocate(&self, cache: &BufferCache) -> FsResult<SectorIndex> {
        self.lock().zero_allocate(cache)
    }

    /// Marks `sector` clear again.
    pub fn release(&self, sector: SectorIndex) {
        self.lock().release(sector)
    }

    /// Number of sectors currently marked allocated, for accounting tests.
    pub fn used_sectors(&self) -> usize {
        self.inner.lock().unwrap().bits.iter().filter(|b| **b).count()
    }

    /// Total bit count (device sector count).
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().bits.len()
    }

    /// Reads the free-map's own bitmap out of its backing inode (sector
    /// `FREE_MAP_SECTOR`) and replaces the in-memory bitmap with it. Called
    /// once, at `mount`.
    pub fn load(cache: &BufferCache, inode_sector: SectorIndex, capacity: u32) -> Arc<Self> {
        let mut bits = vec![false; capacity as usize];
        let mut byte = [0u8; 1];
        for (i, bit) in bits.iter_mut().enumerate() {
            inode::read_raw(cache, inode_sector, i / 8, &mut byte);
            *bit = byte[0] & (1 << (i % 8)) != 0;
        }
        debug!("free-map loaded: {} of {} sectors in use", bits.iter().filter(|b| **b).count(), bits.len());
        Arc::new(Self {
            inner: Mutex::new(FreeMapInner { bits }),
        })
    }

    /// Writes the in-memory bitmap out to its backing inode. Called at
    /// `format` (to materialize the initial image) and at clean `close`.
    pub fn flush(&self, cache: &BufferCache, inode_sector: SectorIndex) {
        let inner = self.inner.lock().unwrap();
        let mut byte = [0u8; 1];
        for (i, chunk) in inner.bits.chunks(8).enumerate() {
            byte[0] = 0;
            for (bit_no, bit) in chunk.iter().enumerate() {
                if *bit {
                    byte[0] |= 1 << bit_no;
                }
            }
            inode::write_raw(cache, inode_sector, i, &byte);
        }
        debug!("free-map flushed: {} of {} sectors in use", inner.bits.iter().filter(|b| **b).count(), inner.bits.len());
    }
}

impl<'a> FreeMapGuard<'a> {
    /// Scans for the lowest clear bit, sets it, and returns its index.
    pub fn allocate(&mut self) -> FsResult<SectorIndex> {
        let pos = self
            .inner
            .bits
            .iter()
            .position(|b| !*b)
            .ok_or(FsError::NoSpace)?;
        self.inner.bits[pos] = true;
        Ok(pos as SectorIndex)
    }

    /// Allocates a sector and immediately zero-fills it in the cache, so
    /// concurrent readers of a freshly linked pointer never see stale
    /// content from the sector's previous occupant.
    pub fn zero_allocate(&mut self, cache: &BufferCache) -> FsResult<SectorIndex> {
        let sector = self.allocate()?;
        let zeros = [0u8; crate::layout::SECTOR_SIZE];
        cache.write(sector, &zeros, 0, crate::layout::SECTOR_SIZE);
        Ok(sector)
    }

    /// Marks `sector` clear again.
    ///
    /// # Panics
    /// Panics on a double release (clearing an already-clear bit), which
    /// can only indicate a bookkeeping bug elsewhere in the crate.
    pub fn release(&mut self, sector: SectorIndex) {
        let bit = self
            .inner
            .bits
            .get_mut(sector as usize)
            .expect("release of out-of-range sector");
        assert!(*bit, "double release of sector {sector}");
        *bit = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn allocate_skips_reserved_sectors() {
        let fm = FreeMap::new(8);
        let a = fm.allocate().unwrap();
        let b = fm.allocate().unwrap();
        assert!(a >= 2 && b >= 2 && a != b);
    }

    #[test]
    fn exhaustion_returns_no_space() {
        let fm = FreeMap::new(2);
        assert_eq!(fm.allocate(), Err(FsError::NoSpace));
    }

    #[test]
    fn release_then_allocate_reuses_bit() {
        let fm = FreeMap::new(3);
        let s = fm.allocate().unwrap();
        fm.release(s);
        let s2 = fm.allocate().unwrap();
        assert_eq!(s, s2);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_panics() {
        let fm = FreeMap::new(3);
        let s = fm.allocate().unwrap();
        fm.release(s);
        fm.release(s);
    }

    #[test]
    fn flush_then_load_round_trips() {
        let device = Arc::new(MemoryDevice::new(32));
        let cache = BufferCache::new(device);
        let fm = FreeMap::new(32);
        let s1 = fm.allocate().unwrap();
        fm.flush(&cache, crate::layout::FREE_MAP_SECTOR);

        let loaded = FreeMap::load(&cache, crate::layout::FREE_MAP_SECTOR, 32);
        assert_eq!(loaded.used_sectors(), fm.used_sectors());
        // s1 must still read as allocated: the next allocation must skip it.
        let s2 = loaded.allocate().unwrap();
        assert_ne!(s1, s2);
    }
}
