//! Directory layer.
//!
//! A directory is a regular inode whose data is an array of fixed-size
//! entries, scanned linearly. `dir_create` seeds two entries, `.` and
//! `..`, pointing at the new directory itself and at its parent.
//!
//! A second, lighter-weight table tracks directories that are currently
//! open (as opposed to merely named), keyed by inumber. `remove` consults
//! it to refuse deleting a directory some other caller still has open;
//! like the inode table, it is a `Weak` map whose `Arc::strong_count` is
//! the open count, so there is no separate counter to keep in sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::debug;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, FsResult};
use crate::fs::FsShared;
use crate::inode::Inode;
use crate::layout::{SectorIndex, DIR_INITIAL_ENTRIES, NAME_MAX, NULL_SECTOR, ROOT_DIR_SECTOR};
use crate::path::next_part;

const ENTRY_NAME_LEN: usize = NAME_MAX + 1;

#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
struct RawEntry {
    inode_sector: u32,
    name: [u8; ENTRY_NAME_LEN],
    in_use: u8,
    is_dir: u8,
    _pad: [u8; 3],
}

const DIRENT_SIZE: usize = std::mem::size_of::<RawEntry>();
const_assert!(DIRENT_SIZE == 24);

impl RawEntry {
    const EMPTY: Self = Self {
        inode_sector: NULL_SECTOR,
        name: [0; ENTRY_NAME_LEN],
        in_use: 0,
        is_dir: 0,
        _pad: [0; 3],
    };

    fn occupied(inode_sector: SectorIndex, name: &str, is_dir: bool) -> Self {
        let mut raw_name = [0u8; ENTRY_NAME_LEN];
        raw_name[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            inode_sector,
            name: raw_name,
            in_use: 1,
            is_dir: is_dir as u8,
            _pad: [0; 3],
        }
    }

    fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).expect("directory entry name is not valid utf-8")
    }
}

/// One resolved directory entry, returned from `lookup`/`readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode_sector: SectorIndex,
    pub is_dir: bool,
}

/// Zero-sized marker whose `Arc::strong_count` (via the open-directory
/// table) serves as a directory's "is this open elsewhere" count.
struct DirToken;

/// Open-directory table: tracks, per inumber, whether any `Directory`
/// handle for it currently exists, for `remove`'s busy check.
pub struct OpenDirTable {
    open: Mutex<HashMap<SectorIndex, Weak<DirToken>>>,
}

impl OpenDirTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { open: Mutex::new(HashMap::new()) })
    }

    fn open(&self, sector: SectorIndex) -> Arc<DirToken> {
        let mut open = self.open.lock().unwrap();
        if let Some(existing) = open.get(&sector).and_then(Weak::upgrade) {
            return existing;
        }
        let token = Arc::new(DirToken);
        open.insert(sector, Arc::downgrade(&token));
        token
    }

    /// Number of live `Directory` handles for `sector`, not counting the
    /// caller's own transient handle used to ask the question (the caller
    /// passes its own token so it can be excluded from the count).
    fn open_count_excluding(&self, sector: SectorIndex, excl: &Arc<DirToken>) -> usize {
        let open = self.open.lock().unwrap();
        match open.get(&sector).and_then(Weak::upgrade) {
            Some(tok) => Arc::strong_count(&tok) - 1 /* our own upgrade */ - if Arc::ptr_eq(&tok, excl) { 1 } else { 0 },
            None => 0,
        }
    }
}

/// An open directory: an inode plus a token in the open-directory table
/// and a read cursor for `readdir`.
pub struct Directory {
    fs: Arc<FsShared>,
    inode: Arc<Inode>,
    token: Arc<DirToken>,
    pos: Mutex<u64>,
}

impl Directory {
    /// Opens the directory whose inode lives at `sector`.
    pub fn open(fs: &Arc<FsShared>, sector: SectorIndex) -> Self {
        let inode = fs.inode_table.open(&fs.cache, &fs.free_map, sector);
        let token = fs.dir_table.open(sector);
        Self {
            fs: fs.clone(),
            inode,
            token,
            pos: Mutex::new(0),
        }
    }

    /// Opens another handle onto the same directory (shares the open
    /// count, same as reopening the underlying inode).
    pub fn reopen(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            inode: self.fs.inode_table.open(&self.fs.cache, &self.fs.free_map, self.inode.inumber()),
            token: self.fs.dir_table.open(self.inode.inumber()),
            pos: Mutex::new(0),
        }
    }

    /// The directory's own inumber.
    pub fn inumber(&self) -> SectorIndex {
        self.inode.inumber()
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    fn entries(&self) -> Vec<RawEntry> {
        let len = self.inode.len() as usize;
        let count = len / DIRENT_SIZE;
        let mut out = Vec::with_capacity(count);
        let mut buf = [0u8; DIRENT_SIZE];
        for i in 0..count {
            self.inode.read_at(&mut buf, (i * DIRENT_SIZE) as u64);
            out.push(RawEntry::read_from(&buf[..]).expect("entry-sized buffer always parses"));
        }
        out
    }

    /// Looks up `name` among this directory's in-use entries.
    pub fn lookup(&self, name: &str) -> Option<DirEntry> {
        self.entries().into_iter().find(|e| e.in_use != 0 && e.name() == name).map(|e| DirEntry {
            name: e.name().to_string(),
            inode_sector: e.inode_sector,
            is_dir: e.is_dir != 0,
        })
    }

    /// Adds a new entry, reusing the first free slot or extending the
    /// directory's data if none is free.
    pub fn add(&self, name: &str, inode_sector: SectorIndex, is_dir: bool) -> FsResult<()> {
        if name.len() > NAME_MAX {
            return Err(FsError::InvalidArgument("directory entry name longer than NAME_MAX"));
        }
        if self.lookup(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let entries = self.entries();
        let entry = RawEntry::occupied(inode_sector, name, is_dir);
        let slot = entries.iter().position(|e| e.in_use == 0);
        let write_at = match slot {
            Some(i) => (i * DIRENT_SIZE) as u64,
            None => self.inode.len(),
        };
        self.inode.write_at(entry.as_bytes(), write_at)?;
        debug!("directory {}: added {name:?} -> sector {inode_sector}", self.inumber());
        Ok(())
    }

    /// Whether this directory has no entries besides `.` and `..`.
    pub fn is_empty(&self) -> bool {
        self.entries()
            .into_iter()
            .all(|e| e.in_use == 0 || e.name() == "." || e.name() == "..")
    }

    /// Removes the entry named `name`. Refuses to remove a subdirectory
    /// that is non-empty or still has a live `Directory` handle elsewhere.
    pub fn remove(&self, name: &str) -> FsResult<()> {
        let entries = self.entries();
        let slot = entries
            .iter()
            .position(|e| e.in_use != 0 && e.name() == name)
            .ok_or(FsError::NotFound)?;
        let entry = entries[slot];

        if entry.is_dir != 0 {
            let victim = Directory::open(&self.fs, entry.inode_sector);
            if !victim.is_empty() {
                return Err(FsError::NotEmpty);
            }
            if self.fs.dir_table.open_count_excluding(entry.inode_sector, &victim.token) > 0 {
                return Err(FsError::Busy);
            }
        }

        self.inode.write_at(RawEntry::EMPTY.as_bytes(), (slot * DIRENT_SIZE) as u64)?;
        let victim_inode = self.fs.inode_table.open(&self.fs.cache, &self.fs.free_map, entry.inode_sector);
        victim_inode.mark_removed();
        debug!("directory {}: removed {name:?}", self.inumber());
        Ok(())
    }

    /// Returns the next in-use entry after the handle's read cursor,
    /// skipping `.` and `..`, advancing the cursor past it.
    pub fn readdir(&self) -> Option<DirEntry> {
        let entries = self.entries();
        let mut pos = self.pos.lock().unwrap();
        while (*pos as usize) < entries.len() {
            let entry = entries[*pos as usize];
            *pos += 1;
            if entry.in_use != 0 && entry.name() != "." && entry.name() != ".." {
                return Some(DirEntry {
                    name: entry.name().to_string(),
                    inode_sector: entry.inode_sector,
                    is_dir: entry.is_dir != 0,
                });
            }
        }
        None
    }
}

/// Creates a fresh directory inode at `sector`, with `.` and `..` already
/// present and pointing at `sector` and `parent_sector` respectively.
pub fn create_on_disk(fs: &Arc<FsShared>, sector: SectorIndex, parent_sector: SectorIndex) -> FsResult<()> {
    let initial_len = (DIR_INITIAL_ENTRIES * DIRENT_SIZE) as u64;
    crate::inode::create_on_disk(&fs.cache, &fs.free_map, sector, initial_len)?;
    let dir = Directory::open(fs, sector);
    dir.add(".", sector, true)?;
    dir.add("..", parent_sector, true)?;
    Ok(())
}

/// Walks `path` starting from `start` (or the root if `path` is absolute),
/// failing if any intermediate component is not a directory or does not
/// exist. The returned directory is the *last directory on the path*; it
/// is the caller's job to look up the final leaf component within it.
pub fn resolve(fs: &Arc<FsShared>, start: &Directory, path: &str) -> FsResult<Directory> {
    let mut current = if path.starts_with('/') {
        Directory::open(fs, ROOT_DIR_SECTOR)
    } else {
        start.reopen()
    };
    let mut rest = path;
    loop {
        match next_part(rest)? {
            None => return Ok(current),
            Some((_, after)) if after.trim_start_matches('/').is_empty() => return Ok(current),
            Some((name, after)) => {
                let entry = current.lookup(name).ok_or(FsError::NotFound)?;
                if !entry.is_dir {
                    return Err(FsError::NotADirectory);
                }
                current = Directory::open(fs, entry.inode_sector);
                rest = after;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::fs::FileSystem;

    fn fresh_fs(num_sectors: u32) -> Arc<FsShared> {
        let device = Arc::new(MemoryDevice::new(num_sectors as usize));
        FileSystem::format(device).into_shared()
    }

    #[test]
    fn root_directory_has_dot_and_dotdot() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        let dot = root.lookup(".").unwrap();
        assert_eq!(dot.inode_sector, ROOT_DIR_SECTOR);
        let dotdot = root.lookup("..").unwrap();
        assert_eq!(dotdot.inode_sector, ROOT_DIR_SECTOR);
    }

    #[test]
    fn add_then_lookup_then_remove() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        root.add("foo", 42, false).unwrap();
        assert_eq!(root.lookup("foo").unwrap().inode_sector, 42);

        assert_eq!(root.add("foo", 7, false), Err(FsError::AlreadyExists));

        root.remove("foo").unwrap();
        assert!(root.lookup("foo").is_none());
    }

    #[test]
    fn is_empty_ignores_dot_entries() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        assert!(root.is_empty());
        root.add("child", 50, false).unwrap();
        assert!(!root.is_empty());
    }

    #[test]
    fn remove_nonempty_subdirectory_fails() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        let sub_sector = fs.free_map.allocate().unwrap();
        create_on_disk(&fs, sub_sector, ROOT_DIR_SECTOR).unwrap();
        root.add("sub", sub_sector, true).unwrap();

        let sub = Directory::open(&fs, sub_sector);
        sub.add("file", 99, false).unwrap();

        assert_eq!(root.remove("sub"), Err(FsError::NotEmpty));
    }

    #[test]
    fn remove_directory_open_elsewhere_is_busy() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        let sub_sector = fs.free_map.allocate().unwrap();
        create_on_disk(&fs, sub_sector, ROOT_DIR_SECTOR).unwrap();
        root.add("sub", sub_sector, true).unwrap();

        let _held_open = Directory::open(&fs, sub_sector);
        assert_eq!(root.remove("sub"), Err(FsError::Busy));
    }

    #[test]
    fn readdir_yields_added_entries_excluding_dot() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        root.add("a", 10, false).unwrap();
        root.add("b", 11, false).unwrap();

        let mut names = Vec::new();
        while let Some(entry) = root.readdir() {
            names.push(entry.name);
        }
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn resolve_walks_nested_path() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        let a_sector = fs.free_map.allocate().unwrap();
        create_on_disk(&fs, a_sector, ROOT_DIR_SECTOR).unwrap();
        root.add("a", a_sector, true).unwrap();

        let resolved = resolve(&fs, &root, "/a/leaf.txt").unwrap();
        assert_eq!(resolved.inumber(), a_sector);
    }

    #[test]
    fn resolve_through_non_directory_fails() {
        let fs = fresh_fs(256);
        let root = Directory::open(&fs, ROOT_DIR_SECTOR);
        root.add("file", 77, false).unwrap();
        assert_eq!(resolve(&fs, &root, "/file/leaf").unwrap_err(), FsError::NotADirectory);
    }
}
