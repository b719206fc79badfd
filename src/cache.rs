//! Buffer cache.
//!
//! A fixed 64-slot, write-back cache sitting between every other layer and
//! the block device. Caching sectors in memory cuts down on device I/O and
//! gives the rest of the crate a synchronization point for sectors touched
//! by concurrent callers.
//!
//! Interface:
//! * `read`/`write` look a sector up (allocating a slot via clock eviction
//!   on a miss) and copy bytes in or out of it.
//! * `flush_all` writes every dirty slot back to the device.
//! * `reset` flushes, invalidates every slot, and zeros the hit/total
//!   counters — used by the `cache_reset()` entry point.
//! * `hit_rate` reports the integer hit percentage since the last reset.
//!
//! Eviction is the one-handed clock algorithm: the hand sweeps the slots,
//! clearing each `used` bit it passes, until it lands on a slot that is
//! either invalid or already has `used == false`.
//!
//! Concurrency follows the lock taxonomy: one cache-wide mutex
//! (`CacheIndex`, protecting the sector → slot mapping, the valid bits, and
//! the clock hand) plus one mutex per slot (protecting the slot's 512-byte
//! payload, its dirty bit, and its used bit). The cache-wide lock is never
//! held across device I/O; see `get` below for the exact handoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use array_macro::array;
use log::{debug, trace};

use crate::device::BlockDevice;
use crate::layout::{SectorIndex, CACHE_CAPACITY, NULL_SECTOR, SECTOR_SIZE};

struct Slot {
    data: [u8; SECTOR_SIZE],
    dirty: bool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            data: [0; SECTOR_SIZE],
            dirty: false,
        }
    }
}

#[derive(Clone, Copy)]
struct SlotTag {
    sector: SectorIndex,
    valid: bool,
    used: bool,
}

impl SlotTag {
    const fn empty() -> Self {
        Self {
            sector: NULL_SECTOR,
            valid: false,
            used: false,
        }
    }
}

struct CacheIndex {
    tags: [SlotTag; CACHE_CAPACITY],
    clock_hand: usize,
}

/// A fixed-capacity, clock-replacement, write-back cache of device sectors.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    index: Mutex<CacheIndex>,
    slots: [Mutex<Slot>; CACHE_CAPACITY],
    hits: AtomicU64,
    total: AtomicU64,
}

impl BufferCache {
    /// Builds an empty cache of `CACHE_CAPACITY` slots over `device`.
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            index: Mutex::new(CacheIndex {
                tags: [SlotTag::empty(); CACHE_CAPACITY],
                clock_hand: 0,
            }),
            slots: array![_ => Mutex::new(Slot::new()); CACHE_CAPACITY],
            hits: AtomicU64::new(0),
            total: AtomicU64::new(0),
        })
    }

    /// Copies `[offset, offset+size)` of `sector`'s cached content into
    /// `dst[..size]`.
    ///
    /// # Panics
    /// Panics if `offset + size > SECTOR_SIZE` (a programmer error, not a
    /// recoverable condition).
    pub fn read(&self, sector: SectorIndex, dst: &mut [u8], offset: usize, size: usize) {
        assert!(offset + size <= SECTOR_SIZE, "cache read out of sector bounds");
        let slot_no = self.get(sector);
        let guard = self.slots[slot_no].lock().unwrap();
        dst[..size].copy_from_slice(&guard.data[offset..offset + size]);
    }

    /// Copies `src[..size]` into `[offset, offset+size)` of `sector`'s
    /// cached content and marks the slot dirty.
    ///
    /// # Panics
    /// Panics if `offset + size > SECTOR_SIZE`.
    pub fn write(&self, sector: SectorIndex, src: &[u8], offset: usize, size: usize) {
        assert!(offset + size <= SECTOR_SIZE, "cache write out of sector bounds");
        let slot_no = self.get(sector);
        let mut guard = self.slots[slot_no].lock().unwrap();
        guard.data[offset..offset + size].copy_from_slice(&src[..size]);
        guard.dirty = true;
    }

    /// Writes every dirty, valid slot back to the device.
    pub fn flush_all(&self) {
        let snapshot: Vec<(usize, SectorIndex)> = {
            let index = self.index.lock().unwrap();
            index
                .tags
                .iter()
                .enumerate()
                .filter(|(_, tag)| tag.valid)
                .map(|(slot_no, tag)| (slot_no, tag.sector))
                .collect()
        };
        for (slot_no, sector) in snapshot {
            let mut guard = self.slots[slot_no].lock().unwrap();
            if guard.dirty {
                self.device.write(sector, &guard.data);
                guard.dirty = false;
            }
        }
    }

    /// Flushes, then invalidates every slot and zeros the hit/total
    /// counters.
    pub fn reset(&self) {
        self.flush_all();
        let mut index = self.index.lock().unwrap();
        for tag in index.tags.iter_mut() {
            *tag = SlotTag::empty();
        }
        index.clock_hand = 0;
        drop(index);
        self.hits.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        debug!("cache reset");
    }

    /// Integer percentage of lookups that found the sector resident, since
    /// the last `reset`.
    pub fn hit_rate(&self) -> i32 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let hits = self.hits.load(Ordering::Relaxed);
        (100 * hits / total) as i32
    }

    /// Resolves `sector` to a slot index, running the lookup/eviction
    /// protocol:
    ///
    /// 1. Acquire the cache lock.
    /// 2. If resident, bump the hit counter, mark it used, and return.
    /// 3. Otherwise run the clock scan to pick a victim slot.
    /// 4. Lock the victim slot while still holding the cache lock (never
    ///    contended: the index still names the old sector, so no other
    ///    caller can reach this slot until we retag it).
    /// 5. Retag the slot and release the cache lock, keeping only the slot
    ///    lock for the write-back/read-in that follows.
    fn get(&self, sector: SectorIndex) -> usize {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut index = self.index.lock().unwrap();

        if let Some(slot_no) = index
            .tags
            .iter()
            .position(|tag| tag.valid && tag.sector == sector)
        {
            index.tags[slot_no].used = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return slot_no;
        }

        let slot_no = Self::clock_scan(&mut index);
        let old_tag = index.tags[slot_no];
        let mut victim = self.slots[slot_no].lock().unwrap();
        index.tags[slot_no] = SlotTag {
            sector,
            valid: true,
            used: true,
        };
        drop(index);

        if old_tag.valid && victim.dirty {
            trace!("evicting dirty sector {} from slot {slot_no}", old_tag.sector);
            self.device.write(old_tag.sector, &victim.data);
        }
        self.device.read(sector, &mut victim.data);
        victim.dirty = false;
        slot_no
    }

    /// Advances the clock hand, clearing `used` bits, until it finds a slot
    /// that is invalid or already unused; that slot is the victim.
    fn clock_scan(index: &mut MutexGuard<'_, CacheIndex>) -> usize {
        loop {
            let hand = index.clock_hand;
            let tag = index.tags[hand];
            index.clock_hand = (hand + 1) % CACHE_CAPACITY;
            if !tag.valid || !tag.used {
                return hand;
            }
            index.tags[hand].used = false;
        }
    }
}
