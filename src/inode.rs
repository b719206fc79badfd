//! Indexed inodes.
//!
//! On-disk layout is a single 512-byte sector: a signed length, 12 direct
//! sector pointers, one single-indirect pointer (128 more pointers), one
//! double-indirect pointer (128 indirect blocks of 128 pointers each), and
//! a magic number, padded out to fill the sector.
//!
//! ```text
//! offset  0   length: i64
//! offset  8   direct[12]: u32
//! offset 56   indirect: u32
//! offset 60   dbl_indirect: u32
//! offset 64   magic: u32
//! offset 68   unused padding to 512
//! ```
//!
//! The open-inode table (keyed by sector number) hands out `Arc<Inode>`;
//! its `Weak` map plus `Arc::strong_count` stands in for the original's
//! hand-maintained `open_cnt`, and the table's own mutex is held across
//! both the "is anyone else holding this" check and any insert/upgrade, so
//! a thread finalizing the last close can never be raced by a concurrent
//! reopen that resurrects a half-dropped inode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::BufferCache;
use crate::error::{FsError, FsResult};
use crate::free_map::FreeMap;
use crate::layout::{
    bytes_to_sectors, SectorIndex, INODE_MAGIC, MAX_FILE_SECTORS, NULL_SECTOR, NUM_DIRECT,
    PTRS_PER_SECTOR, SECTOR_SIZE,
};

const LENGTH_OFFSET: usize = 0;
const DIRECT_OFFSET: usize = 8;
const INDIRECT_OFFSET: usize = DIRECT_OFFSET + NUM_DIRECT * 4;
const DBL_INDIRECT_OFFSET: usize = INDIRECT_OFFSET + 4;
const MAGIC_OFFSET: usize = DBL_INDIRECT_OFFSET + 4;

#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
struct InodeDisk {
    length: i64,
    direct: [u32; NUM_DIRECT],
    indirect: u32,
    dbl_indirect: u32,
    magic: u32,
    unused: [u32; (SECTOR_SIZE - MAGIC_OFFSET - 4) / 4],
}

const_assert!(std::mem::size_of::<InodeDisk>() == SECTOR_SIZE);

impl InodeDisk {
    fn read(cache: &BufferCache, sector: SectorIndex) -> Self {
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(sector, &mut buf, 0, SECTOR_SIZE);
        Self::read_from(&buf[..]).expect("sector-sized buffer always parses as InodeDisk")
    }

    fn write(&self, cache: &BufferCache, sector: SectorIndex) {
        cache.write(sector, self.as_bytes(), 0, SECTOR_SIZE);
    }
}

/// Which region of the inode's index addresses a given data-sector index.
enum IndexPath {
    Direct(usize),
    Indirect(usize),
    DoubleIndirect(usize, usize),
}

/// Classifies a zero-based data-sector index into the direct, indirect, or
/// double-indirect region, or `None` if it is beyond `MAX_FILE_SECTORS`.
fn index_path(idx: usize) -> Option<IndexPath> {
    if idx < NUM_DIRECT {
        return Some(IndexPath::Direct(idx));
    }
    let idx = idx - NUM_DIRECT;
    if idx < PTRS_PER_SECTOR {
        return Some(IndexPath::Indirect(idx));
    }
    let idx = idx - PTRS_PER_SECTOR;
    if idx < MAX_FILE_SECTORS - NUM_DIRECT - PTRS_PER_SECTOR {
        return Some(IndexPath::DoubleIndirect(idx / PTRS_PER_SECTOR, idx % PTRS_PER_SECTOR));
    }
    None
}

fn read_ptr(cache: &BufferCache, block: SectorIndex, slot: usize) -> SectorIndex {
    let mut buf = [0u8; 4];
    cache.read(block, &mut buf, slot * 4, 4);
    u32::from_ne_bytes(buf)
}

fn write_ptr(cache: &BufferCache, block: SectorIndex, slot: usize, value: SectorIndex) {
    cache.write(block, &value.to_ne_bytes(), slot * 4, 4);
}

/// Resolves data-sector index `idx` of the inode at `sector` to a physical
/// sector, or `NULL_SECTOR` if that index has never been allocated. Never
/// allocates: used by reads, which must not turn a hole into real storage.
fn lookup(cache: &BufferCache, sector: SectorIndex, idx: usize) -> SectorIndex {
    let disk = InodeDisk::read(cache, sector);
    match index_path(idx).expect("data-sector index beyond MAX_FILE_SECTORS") {
        IndexPath::Direct(i) => disk.direct[i],
        IndexPath::Indirect(i) => {
            if disk.indirect == NULL_SECTOR {
                return NULL_SECTOR;
            }
            read_ptr(cache, disk.indirect, i)
        }
        IndexPath::DoubleIndirect(outer, inner) => {
            if disk.dbl_indirect == NULL_SECTOR {
                return NULL_SECTOR;
            }
            let leaf = read_ptr(cache, disk.dbl_indirect, outer);
            if leaf == NULL_SECTOR {
                return NULL_SECTOR;
            }
            read_ptr(cache, leaf, inner)
        }
    }
}

/// Resolves data-sector index `idx`, allocating (and zero-filling) any
/// index block or data block that does not yet exist along the way.
/// `alloc` is generic over a per-call `&FreeMap` borrow or a whole-loop
/// `&mut FreeMapGuard`, so `write_at`'s single-sector growth and
/// `create_on_disk`'s whole-file preallocation share one implementation.
fn lookup_or_create(
    cache: &BufferCache,
    alloc: &mut dyn FnMut() -> FsResult<SectorIndex>,
    sector: SectorIndex,
    idx: usize,
) -> FsResult<SectorIndex> {
    let mut disk = InodeDisk::read(cache, sector);
    let result = match index_path(idx).expect("data-sector index beyond MAX_FILE_SECTORS") {
        IndexPath::Direct(i) => {
            if disk.direct[i] == NULL_SECTOR {
                disk.direct[i] = alloc()?;
                disk.write(cache, sector);
            }
            disk.direct[i]
        }
        IndexPath::Indirect(i) => {
            if disk.indirect == NULL_SECTOR {
                disk.indirect = alloc()?;
                disk.write(cache, sector);
            }
            let existing = read_ptr(cache, disk.indirect, i);
            if existing == NULL_SECTOR {
                let leaf = alloc()?;
                write_ptr(cache, disk.indirect, i, leaf);
                leaf
            } else {
                existing
            }
        }
        IndexPath::DoubleIndirect(outer, inner) => {
            if disk.dbl_indirect == NULL_SECTOR {
                disk.dbl_indirect = alloc()?;
                disk.write(cache, sector);
            }
            let mut block = read_ptr(cache, disk.dbl_indirect, outer);
            if block == NULL_SECTOR {
                block = alloc()?;
                write_ptr(cache, disk.dbl_indirect, outer, block);
            }
            let existing = read_ptr(cache, block, inner);
            if existing == NULL_SECTOR {
                let leaf = alloc()?;
                write_ptr(cache, block, inner, leaf);
                leaf
            } else {
                existing
            }
        }
    };
    Ok(result)
}

/// Reads one byte out of the inode's raw data region without going through
/// the open-inode table. Used only by the free-map to read its own backing
/// bitmap, where opening an `Inode` normally would be circular.
pub(crate) fn read_raw(cache: &BufferCache, inode_sector: SectorIndex, byte_idx: usize, dst: &mut [u8; 1]) {
    let data_sector = lookup(cache, inode_sector, byte_idx / SECTOR_SIZE);
    if data_sector == NULL_SECTOR {
        dst[0] = 0;
        return;
    }
    cache.read(data_sector, dst, byte_idx % SECTOR_SIZE, 1);
}

/// Writes one byte into the inode's raw data region without going through
/// the open-inode table. See `read_raw`.
pub(crate) fn write_raw(cache: &BufferCache, inode_sector: SectorIndex, byte_idx: usize, src: &[u8; 1]) {
    let data_sector = lookup(cache, inode_sector, byte_idx / SECTOR_SIZE);
    assert!(
        data_sector != NULL_SECTOR,
        "free-map backing sector {byte_idx} not preallocated at format time"
    );
    cache.write(data_sector, src, byte_idx % SECTOR_SIZE, 1);
}

/// Creates a fresh inode at `sector`: allocates every data/index sector
/// needed to hold `length` bytes (all zero-filled), then stamps `length`
/// and the magic number. Holds `free_map` locked for the whole allocation
/// loop so no concurrent caller observes a partially built file.
///
/// On an allocation failure partway through, every sector this call
/// managed to link in is released before the error propagates (spec.md
/// §4.4.3/§7: "on any failure, run `free_all_blocks` and return failure"
/// / "allocation failures in inode growth must release partially
/// allocated sectors"). `sector` itself is the caller's to release, not
/// this function's — it was handed to us already allocated, matching the
/// original's `inode_create`/`inode_free_sector` split where the inode's
/// own sector is freed by the caller, not by the free-blocks walk.
pub fn create_on_disk(
    cache: &BufferCache,
    free_map: &FreeMap,
    sector: SectorIndex,
    length: u64,
) -> FsResult<()> {
    let zeros = InodeDisk {
        length: 0,
        direct: [NULL_SECTOR; NUM_DIRECT],
        indirect: NULL_SECTOR,
        dbl_indirect: NULL_SECTOR,
        magic: INODE_MAGIC,
        unused: [0; (SECTOR_SIZE - MAGIC_OFFSET - 4) / 4],
    };
    zeros.write(cache, sector);

    let num_sectors = bytes_to_sectors(length) as usize;
    let cleanup = scopeguard::guard((), |()| free_data_blocks(cache, free_map, sector));
    {
        let mut guard = free_map.lock();
        for idx in 0..num_sectors {
            let mut alloc = || guard.zero_allocate(cache);
            lookup_or_create(cache, &mut alloc, sector, idx)?;
        }
    }
    scopeguard::ScopeGuard::into_inner(cleanup);

    let mut disk = InodeDisk::read(cache, sector);
    disk.length = length as i64;
    disk.write(cache, sector);
    debug!("inode created at sector {sector}: {length} bytes, {num_sectors} data sectors");
    Ok(())
}

/// Releases every data and index sector reachable from the inode at
/// `sector` back to `free_map` — direct pointers, the indirect block and
/// its leaves, the double-indirect block and its two levels of leaves —
/// but not `sector` itself. Frees bottom-up (leaves, then index blocks)
/// so a crash mid-free never leaves a dangling pointer to an
/// already-freed sector.
fn free_data_blocks(cache: &BufferCache, free_map: &FreeMap, sector: SectorIndex) {
    let disk = InodeDisk::read(cache, sector);
    let mut guard = free_map.lock();

    for &d in disk.direct.iter() {
        if d != NULL_SECTOR {
            guard.release(d);
        }
    }

    if disk.indirect != NULL_SECTOR {
        for i in 0..PTRS_PER_SECTOR {
            let leaf = read_ptr(cache, disk.indirect, i);
            if leaf != NULL_SECTOR {
                guard.release(leaf);
            }
        }
        guard.release(disk.indirect);
    }

    if disk.dbl_indirect != NULL_SECTOR {
        for outer in 0..PTRS_PER_SECTOR {
            let block = read_ptr(cache, disk.dbl_indirect, outer);
            if block == NULL_SECTOR {
                continue;
            }
            for inner in 0..PTRS_PER_SECTOR {
                let leaf = read_ptr(cache, block, inner);
                if leaf != NULL_SECTOR {
                    guard.release(leaf);
                }
            }
            guard.release(block);
        }
        guard.release(disk.dbl_indirect);
    }

    trace!("freed data blocks of inode at sector {sector}");
}

/// Releases a fully-built inode's data blocks *and* its own sector. Used by
/// callers that must unwind a successful `create_on_disk` (or
/// `directory::create_on_disk`, which is `create_on_disk` plus two entries
/// written into the space it allocated) because a later step — linking the
/// new name into its parent directory — failed, e.g. on a duplicate name.
/// Unlike `OpenInodeTable::close`'s last-close cleanup, there is no open
/// handle here to route through `mark_removed`/`Drop`: the inode was never
/// handed to a caller, so this frees it directly.
pub(crate) fn destroy_on_disk(cache: &BufferCache, free_map: &FreeMap, sector: SectorIndex) {
    free_data_blocks(cache, free_map, sector);
    free_map.release(sector);
}

struct InodeState {
    len: u64,
    deny_write_cnt: u32,
    removed: bool,
}

/// A reference-counted open inode. Cloning reopens it (the original's
/// `inode_reopen`): every clone shares the same underlying state, and the
/// sector is only actually freed when the last clone drops.
pub struct Inode {
    sector: SectorIndex,
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    table: Arc<OpenInodeTable>,
    state: Mutex<InodeState>,
}

impl Inode {
    fn new(sector: SectorIndex, cache: Arc<BufferCache>, free_map: Arc<FreeMap>, table: Arc<OpenInodeTable>) -> Arc<Self> {
        let disk = InodeDisk::read(&cache, sector);
        assert_eq!(disk.magic, INODE_MAGIC, "inode at sector {sector} has bad magic: not formatted, or corrupt");
        Arc::new(Self {
            sector,
            cache,
            free_map,
            table,
            state: Mutex::new(InodeState {
                len: disk.length as u64,
                deny_write_cnt: 0,
                removed: false,
            }),
        })
    }

    /// The sector number this inode lives at; doubles as its inumber.
    pub fn inumber(&self) -> SectorIndex {
        self.sector
    }

    /// Current length in bytes.
    pub fn len(&self) -> u64 {
        self.state.lock().unwrap().len
    }

    /// Writes `new_len` to the on-disk length field. Does not touch
    /// `self.state`; callers that already hold the metadata lock update
    /// `state.len` themselves once this returns, so there is exactly one
    /// lock acquisition across the read-modify-write.
    fn write_len_to_disk(&self, new_len: u64) {
        let mut disk = InodeDisk::read(&self.cache, self.sector);
        disk.length = new_len as i64;
        disk.write(&self.cache, self.sector);
    }

    /// Reads up to `dst.len()` bytes starting at `offset`. Bytes at or past
    /// the current length, and holes inside it, read back as zero; a read
    /// never allocates a sector. Returns the number of bytes actually
    /// copied (less than `dst.len()` only at end of file).
    ///
    /// Holds the inode's metadata lock for the whole call, so a concurrent
    /// `write_at` growing the file can't be interleaved with the length
    /// check that decides how much of `dst` to fill.
    pub fn read_at(&self, dst: &mut [u8], offset: u64) -> usize {
        let state = self.state.lock().unwrap();
        let len = state.len;
        if offset >= len {
            return 0;
        }
        let to_read = (dst.len() as u64).min(len - offset) as usize;
        let mut done = 0;
        while done < to_read {
            let pos = offset + done as u64;
            let sector_idx = (pos / SECTOR_SIZE as u64) as usize;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - sector_ofs).min(to_read - done);

            let data_sector = lookup(&self.cache, self.sector, sector_idx);
            if data_sector == NULL_SECTOR {
                dst[done..done + chunk].fill(0);
            } else {
                self.cache.read(data_sector, &mut dst[done..done + chunk], sector_ofs, chunk);
            }
            done += chunk;
        }
        done
    }

    /// Writes `src.len()` bytes starting at `offset`, growing the file (and
    /// zero-filling any hole up to `offset`) if needed. Returns the number
    /// of bytes written, which is always `src.len()` unless growth fails
    /// with `NoSpace` partway through, in which case it is the prefix that
    /// made it to disk; returns `0` immediately if writes are currently
    /// denied.
    ///
    /// Holds the inode's metadata lock for the whole call: the grow check
    /// (`end > state.len`) and the length update it triggers happen under
    /// one acquisition, so two callers growing the same file concurrently
    /// can't race and have the smaller `end` win.
    pub fn write_at(&self, src: &[u8], offset: u64) -> FsResult<usize> {
        let mut state = self.state.lock().unwrap();
        if state.deny_write_cnt > 0 {
            return Ok(0);
        }
        let end = offset + src.len() as u64;
        if end > state.len {
            self.write_len_to_disk(end);
            state.len = end;
        }

        let mut done = 0;
        while done < src.len() {
            let pos = offset + done as u64;
            let sector_idx = (pos / SECTOR_SIZE as u64) as usize;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - sector_ofs).min(src.len() - done);

            let free_map = &self.free_map;
            let mut alloc = || free_map.zero_allocate(&self.cache);
            let data_sector = lookup_or_create(&self.cache, &mut alloc, self.sector, sector_idx)?;
            self.cache.write(data_sector, &src[done..done + chunk], sector_ofs, chunk);
            done += chunk;
        }
        Ok(done)
    }

    /// Disallows writes to this inode (used while a process image is
    /// mapped for execution). Writes already in flight are unaffected;
    /// this only blocks future `write_at` calls at the facade layer.
    pub fn deny_write(&self) {
        self.state.lock().unwrap().deny_write_cnt += 1;
    }

    /// Re-allows writes denied by a matching `deny_write` call.
    pub fn allow_write(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.deny_write_cnt > 0, "allow_write without matching deny_write");
        state.deny_write_cnt -= 1;
    }

    /// Whether writes are currently denied.
    pub fn write_denied(&self) -> bool {
        self.state.lock().unwrap().deny_write_cnt > 0
    }

    /// Marks this inode for deletion once the last open handle closes.
    pub fn mark_removed(&self) {
        self.state.lock().unwrap().removed = true;
    }

    /// Whether `mark_removed` has been called on this inode.
    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        self.table.close(self);
    }
}

/// Open-inode table: hands out a shared `Arc<Inode>` per sector, so two
/// callers opening the same file see the same length/deny-write state and
/// the same eventual last-close cleanup.
pub struct OpenInodeTable {
    open: Mutex<HashMap<SectorIndex, Weak<Inode>>>,
}

impl OpenInodeTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { open: Mutex::new(HashMap::new()) })
    }

    /// Returns the already-open inode at `sector`, or opens a fresh one.
    pub fn open(
        self: &Arc<Self>,
        cache: &Arc<BufferCache>,
        free_map: &Arc<FreeMap>,
        sector: SectorIndex,
    ) -> Arc<Inode> {
        let mut open = self.open.lock().unwrap();
        if let Some(existing) = open.get(&sector).and_then(Weak::upgrade) {
            return existing;
        }
        let inode = Inode::new(sector, cache.clone(), free_map.clone(), self.clone());
        open.insert(sector, Arc::downgrade(&inode));
        inode
    }

    /// Called from `Inode::drop`. Removes the table entry and, if this was
    /// truly the last reference and the inode was marked removed, frees
    /// its blocks and its own sector. The "is this the last reference"
    /// check happens under the same lock as the table removal, so a
    /// concurrent `open` can never resurrect an inode this call is about
    /// to free.
    fn close(&self, inode: &Inode) {
        let mut open = self.open.lock().unwrap();
        let still_referenced = open
            .get(&inode.sector)
            .and_then(Weak::upgrade)
            .is_some();
        if still_referenced {
            return;
        }
        open.remove(&inode.sector);
        drop(open);

        if inode.is_removed() {
            free_data_blocks(&inode.cache, &inode.free_map, inode.sector);
            inode.free_map.release(inode.sector);
            debug!("inode at sector {} freed on last close", inode.sector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::layout::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

    fn fresh(num_sectors: usize) -> (Arc<BufferCache>, Arc<FreeMap>, Arc<OpenInodeTable>) {
        let device = Arc::new(MemoryDevice::new(num_sectors));
        let cache = BufferCache::new(device);
        let free_map = FreeMap::new(num_sectors as u32);
        (cache, free_map, OpenInodeTable::new())
    }

    fn alloc_sector(free_map: &FreeMap) -> SectorIndex {
        free_map.allocate().unwrap()
    }

    #[test]
    fn create_then_open_reads_back_length() {
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 100).unwrap();
        let inode = table.open(&cache, &free_map, sector);
        assert_eq!(inode.len(), 100);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 0).unwrap();
        let inode = table.open(&cache, &free_map, sector);

        inode.write_at(b"hello world", 0).unwrap();
        let mut buf = [0u8; 11];
        let n = inode.read_at(&mut buf, 0);
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn sparse_write_zero_fills_hole() {
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 0).unwrap();
        let inode = table.open(&cache, &free_map, sector);

        inode.write_at(b"end", 1000).unwrap();
        let mut buf = [0xFFu8; 10];
        let n = inode.read_at(&mut buf, 0);
        assert_eq!(n, 10);
        assert_eq!(buf, [0u8; 10]);
    }

    #[test]
    fn read_past_eof_returns_zero_and_leaves_buffer() {
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 4).unwrap();
        let inode = table.open(&cache, &free_map, sector);

        let mut buf = [0xABu8; 4];
        let n = inode.read_at(&mut buf, 10);
        assert_eq!(n, 0);
        assert_eq!(buf, [0xAB; 4]);
    }

    #[test]
    fn write_across_indirect_boundary_crosses_sectors() {
        let (cache, free_map, table) = fresh(4096);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 0).unwrap();
        let inode = table.open(&cache, &free_map, sector);

        let offset = (NUM_DIRECT as u64) * SECTOR_SIZE as u64 - 2;
        inode.write_at(&[0xCD; 4], offset).unwrap();
        let mut buf = [0u8; 4];
        inode.read_at(&mut buf, offset);
        assert_eq!(buf, [0xCD; 4]);
    }

    #[test]
    fn reopen_shares_state_via_clone() {
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 0).unwrap();
        let a = table.open(&cache, &free_map, sector);
        let b = table.open(&cache, &free_map, sector);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_frees_sectors_only_on_last_close() {
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 0).unwrap();

        let a = table.open(&cache, &free_map, sector);
        let b = table.open(&cache, &free_map, sector);
        a.write_at(b"x", 0).unwrap();
        let used_before = free_map.used_sectors();

        a.mark_removed();
        drop(a);
        assert_eq!(free_map.used_sectors(), used_before, "still open via b, must not free yet");

        drop(b);
        assert!(free_map.used_sectors() < used_before, "last close must free blocks and the inode sector");
    }

    #[test]
    fn deny_write_cnt_tracked() {
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 0).unwrap();
        let inode = table.open(&cache, &free_map, sector);
        assert!(!inode.write_denied());
        inode.deny_write();
        assert!(inode.write_denied());
        inode.allow_write();
        assert!(!inode.write_denied());
    }

    #[test]
    fn index_path_classifies_regions() {
        assert!(matches!(index_path(0), Some(IndexPath::Direct(0))));
        assert!(matches!(index_path(NUM_DIRECT), Some(IndexPath::Indirect(0))));
        assert!(matches!(
            index_path(NUM_DIRECT + PTRS_PER_SECTOR),
            Some(IndexPath::DoubleIndirect(0, 0))
        ));
        assert!(index_path(MAX_FILE_SECTORS).is_none());
    }

    #[test]
    fn reserved_sectors_constants_are_distinct() {
        assert_ne!(FREE_MAP_SECTOR, ROOT_DIR_SECTOR);
    }

    #[test]
    fn create_failure_releases_partial_allocation() {
        // Just enough free sectors for the inode itself plus a couple of
        // data blocks, not the whole file: the allocation loop must fail
        // partway through and release everything it managed to link in,
        // leaving only the inode's own (caller-owned) sector allocated.
        let (cache, free_map, _table) = fresh(6);
        let sector = alloc_sector(&free_map); // 1 of 6 taken; 5 left
        let used_before = free_map.used_sectors();

        let result = create_on_disk(&cache, &free_map, sector, 10 * SECTOR_SIZE as u64);
        assert_eq!(result, Err(FsError::NoSpace));
        assert_eq!(
            free_map.used_sectors(),
            used_before,
            "failed create must release every sector it allocated, leaving only the caller's inode sector"
        );
    }

    #[test]
    fn destroy_on_disk_releases_data_and_own_sector() {
        let (cache, free_map, _table) = fresh(64);
        let used_before = free_map.used_sectors();

        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 4 * SECTOR_SIZE as u64).unwrap();
        assert!(free_map.used_sectors() > used_before);

        destroy_on_disk(&cache, &free_map, sector);
        assert_eq!(
            free_map.used_sectors(),
            used_before,
            "destroy_on_disk must release both the data sectors and the inode's own sector"
        );
    }

    #[test]
    fn concurrent_growing_writes_never_lose_the_longer_length() {
        // Two threads each append past the other's target offset. Whichever
        // write's length update is interleaved last must win: the final
        // length must be the max of the two, never the smaller one lost to
        // a non-atomic check-then-set.
        let (cache, free_map, table) = fresh(64);
        let sector = alloc_sector(&free_map);
        create_on_disk(&cache, &free_map, sector, 0).unwrap();
        let a = table.open(&cache, &free_map, sector);
        let b = a.clone();

        let t1 = std::thread::spawn(move || a.write_at(&[1u8; 100], 0).unwrap());
        let t2 = std::thread::spawn(move || b.write_at(&[2u8; 200], 0).unwrap());
        t1.join().unwrap();
        t2.join().unwrap();

        let inode = table.open(&cache, &free_map, sector);
        assert_eq!(inode.len(), 200, "final length must be the larger of the two concurrent writes");
    }
}
