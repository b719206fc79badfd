//! The file system facade: `format`/`mount`/`close` lifecycle, a
//! per-caller `Session` standing in for "the calling thread" (since this
//! crate has no process table of its own to hang a `cwd` off of), and the
//! `Handle` returned by `open`.
//!
//! Every `Session` method is typed (`FsResult<T>`) internally and
//! collapsed to the bool/short-count contract at the small set of public
//! entry points, the same split the teacher's kernel keeps between an
//! internal `Result` and the raw integer a syscall returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::cache::BufferCache;
use crate::device::BlockDevice;
use crate::directory::{self, DirEntry, Directory, OpenDirTable};
use crate::error::{FsError, FsResult};
use crate::free_map::FreeMap;
use crate::inode::{Inode, OpenInodeTable};
use crate::layout::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use crate::path::split_for_resolve;

/// State shared by every `Session` over one mounted device.
pub struct FsShared {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) cache: Arc<BufferCache>,
    pub(crate) free_map: Arc<FreeMap>,
    pub(crate) inode_table: Arc<OpenInodeTable>,
    pub(crate) dir_table: Arc<OpenDirTable>,
}

/// A mounted file system. Owns the shared state; `Session`s borrow it to
/// model independent callers with independent working directories.
pub struct FileSystem {
    shared: Arc<FsShared>,
}

impl FileSystem {
    /// Builds a fresh image on `device`: an empty free-map (with its own
    /// and the root directory's sectors pre-reserved), the free-map's own
    /// backing inode, and an empty root directory.
    pub fn format(device: Arc<dyn BlockDevice>) -> Self {
        let capacity = device.num_sectors();
        let cache = BufferCache::new(device.clone());
        let free_map = FreeMap::new(capacity);

        let free_map_bytes = (free_map.capacity() as u64 + 7) / 8;
        crate::inode::create_on_disk(&cache, &free_map, FREE_MAP_SECTOR, free_map_bytes)
            .expect("free-map's own backing sectors must fit a freshly formatted device");
        free_map.flush(&cache, FREE_MAP_SECTOR);

        let shared = Arc::new(FsShared {
            device,
            cache,
            free_map,
            inode_table: OpenInodeTable::new(),
            dir_table: OpenDirTable::new(),
        });
        directory::create_on_disk(&shared, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR)
            .expect("root directory must fit a freshly formatted device");
        info!("formatted a {capacity}-sector device");
        Self { shared }
    }

    /// Mounts an already-formatted device, loading the free-map bitmap
    /// back out of its backing inode.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Self {
        let capacity = device.num_sectors();
        let cache = BufferCache::new(device.clone());
        let free_map = FreeMap::load(&cache, FREE_MAP_SECTOR, capacity);
        info!("mounted a {capacity}-sector device, {} sectors in use", free_map.used_sectors());
        Self {
            shared: Arc::new(FsShared {
                device,
                cache,
                free_map,
                inode_table: OpenInodeTable::new(),
                dir_table: OpenDirTable::new(),
            }),
        }
    }

    /// Flushes the free-map and every dirty cache slot back to the
    /// device. Consumes `self`: there is nothing sensible to do with a
    /// `FileSystem` after this besides drop it.
    pub fn close(self) {
        self.shared.free_map.flush(&self.shared.cache, FREE_MAP_SECTOR);
        self.shared.cache.flush_all();
        info!("file system closed");
    }

    /// Opens a session (a fresh working directory, rooted at `/`) against
    /// this mount. Multiple sessions may be opened concurrently to model
    /// multiple independent callers.
    pub fn session(&self) -> Session {
        Session {
            fs: self.shared.clone(),
            cwd: Mutex::new(Directory::open(&self.shared, ROOT_DIR_SECTOR)),
        }
    }

    /// Resets the buffer cache (flush, invalidate, zero hit-rate counters).
    pub fn cache_reset(&self) {
        self.shared.cache.reset();
    }

    /// Integer cache hit percentage since the last reset.
    pub fn hit_rate(&self) -> i32 {
        self.shared.cache.hit_rate()
    }

    /// Number of sector writes that have reached the device since mount.
    pub fn write_cnt(&self) -> u64 {
        self.shared.device.write_count()
    }

    #[cfg(test)]
    pub(crate) fn into_shared(self) -> Arc<FsShared> {
        self.shared
    }
}

/// A regular-file handle: an open inode plus an independent read/write
/// cursor (distinct sessions, or repeated `open` calls from the same
/// session, each get their own cursor over the shared inode).
pub struct FileHandle {
    inode: Arc<Inode>,
    pos: AtomicU64,
}

impl FileHandle {
    /// Reads into `buf` at the current cursor, advancing it by the number
    /// of bytes actually read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let pos = self.pos.load(Ordering::Relaxed);
        let n = self.inode.read_at(buf, pos);
        self.pos.store(pos + n as u64, Ordering::Relaxed);
        n
    }

    /// Writes `buf` at the current cursor, growing the file if needed,
    /// advancing the cursor by the number of bytes actually written.
    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        if self.inode.write_denied() {
            return Err(FsError::InvalidArgument("write denied on this file"));
        }
        let pos = self.pos.load(Ordering::Relaxed);
        let n = self.inode.write_at(buf, pos)?;
        self.pos.store(pos + n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Moves the cursor to an absolute byte offset.
    pub fn seek(&self, pos: u64) {
        self.pos.store(pos, Ordering::Relaxed);
    }

    /// Current cursor position.
    pub fn tell(&self) -> u64 {
        self.pos.load(Ordering::Relaxed)
    }

    /// Current file length in bytes.
    pub fn length(&self) -> u64 {
        self.inode.len()
    }

    /// The backing inode's sector number.
    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    /// Freezes the file against further writes (used while it backs a
    /// running process image).
    pub fn deny_write(&self) {
        self.inode.deny_write();
    }

    /// Releases a `deny_write` previously placed on this file.
    pub fn allow_write(&self) {
        self.inode.allow_write();
    }
}

/// A handle returned by `Session::open`: either a regular file or a
/// directory, dispatching file-only or directory-only operations to
/// `FsError::IsADirectory`/`NotADirectory` as appropriate.
pub enum Handle {
    File(FileHandle),
    Dir(Directory),
}

impl Handle {
    pub fn is_dir(&self) -> bool {
        matches!(self, Handle::Dir(_))
    }

    pub fn inumber(&self) -> u32 {
        match self {
            Handle::File(f) => f.inumber(),
            Handle::Dir(d) => d.inumber(),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        match self {
            Handle::File(f) => Ok(f.read(buf)),
            Handle::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        match self {
            Handle::File(f) => f.write(buf),
            Handle::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn seek(&self, pos: u64) -> FsResult<()> {
        match self {
            Handle::File(f) => {
                f.seek(pos);
                Ok(())
            }
            Handle::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn tell(&self) -> FsResult<u64> {
        match self {
            Handle::File(f) => Ok(f.tell()),
            Handle::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn length(&self) -> FsResult<u64> {
        match self {
            Handle::File(f) => Ok(f.length()),
            Handle::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn readdir(&self) -> FsResult<Option<DirEntry>> {
        match self {
            Handle::File(_) => Err(FsError::NotADirectory),
            Handle::Dir(d) => Ok(d.readdir()),
        }
    }

    pub fn deny_write(&self) -> FsResult<()> {
        match self {
            Handle::File(f) => {
                f.deny_write();
                Ok(())
            }
            Handle::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn allow_write(&self) -> FsResult<()> {
        match self {
            Handle::File(f) => {
                f.allow_write();
                Ok(())
            }
            Handle::Dir(_) => Err(FsError::IsADirectory),
        }
    }
}

/// One caller's view of a mounted file system: a shared reference to the
/// mount plus its own current directory. Each `chdir` only affects this
/// session.
pub struct Session {
    fs: Arc<FsShared>,
    cwd: Mutex<Directory>,
}

impl Session {
    fn try_create(&self, path: &str, initial_size: u64) -> FsResult<()> {
        let (parent_path, name) = split_for_resolve(path);
        if name.is_empty() {
            return Err(FsError::InvalidArgument("path has no file name"));
        }
        let cwd = self.cwd.lock().unwrap();
        let parent = directory::resolve(&self.fs, &cwd, &parent_path)?;

        let sector = self.fs.free_map.allocate()?;
        if let Err(e) = crate::inode::create_on_disk(&self.fs.cache, &self.fs.free_map, sector, initial_size) {
            self.fs.free_map.release(sector);
            return Err(e);
        }
        if let Err(e) = parent.add(&name, sector, false) {
            // `create_on_disk` above already succeeded, so `sector` owns a
            // full block tree for `initial_size` bytes, not just its own
            // sector — release that tree too, or it leaks permanently.
            crate::inode::destroy_on_disk(&self.fs.cache, &self.fs.free_map, sector);
            return Err(e);
        }
        Ok(())
    }

    /// Creates a regular file of `initial_size` bytes (all zero) at
    /// `path`. Returns whether it succeeded.
    pub fn create(&self, path: &str, initial_size: u64) -> bool {
        self.try_create(path, initial_size).is_ok()
    }

    fn try_open(&self, path: &str) -> FsResult<Handle> {
        if path.is_empty() {
            return Err(FsError::InvalidArgument("empty path"));
        }
        let (parent_path, name) = split_for_resolve(path);
        let cwd = self.cwd.lock().unwrap();

        if name.is_empty() {
            // A path that is only separators names the directory `resolve`
            // itself lands on (e.g. "/" or "///").
            let dir = directory::resolve(&self.fs, &cwd, &parent_path)?;
            return Ok(Handle::Dir(dir));
        }

        let parent = directory::resolve(&self.fs, &cwd, &parent_path)?;
        let entry = parent.lookup(&name).ok_or(FsError::NotFound)?;
        if entry.is_dir {
            Ok(Handle::Dir(Directory::open(&self.fs, entry.inode_sector)))
        } else {
            let inode = self.fs.inode_table.open(&self.fs.cache, &self.fs.free_map, entry.inode_sector);
            Ok(Handle::File(FileHandle { inode, pos: AtomicU64::new(0) }))
        }
    }

    /// Opens `path`, returning a handle and whether it names a directory.
    pub fn open(&self, path: &str) -> Option<(Handle, bool)> {
        self.try_open(path).ok().map(|h| {
            let is_dir = h.is_dir();
            (h, is_dir)
        })
    }

    fn try_remove(&self, path: &str) -> FsResult<()> {
        let (parent_path, name) = split_for_resolve(path);
        if name.is_empty() {
            return Err(FsError::InvalidArgument("cannot remove the root directory"));
        }
        let cwd = self.cwd.lock().unwrap();
        let parent = directory::resolve(&self.fs, &cwd, &parent_path)?;
        parent.remove(&name)
    }

    /// Removes the file or empty, not-open-elsewhere directory at `path`.
    pub fn remove(&self, path: &str) -> bool {
        self.try_remove(path).is_ok()
    }

    fn try_mkdir(&self, path: &str) -> FsResult<()> {
        let (parent_path, name) = split_for_resolve(path);
        if name.is_empty() {
            return Err(FsError::InvalidArgument("path has no directory name"));
        }
        let cwd = self.cwd.lock().unwrap();
        let parent = directory::resolve(&self.fs, &cwd, &parent_path)?;

        let sector = self.fs.free_map.allocate()?;
        if let Err(e) = directory::create_on_disk(&self.fs, sector, parent.inumber()) {
            self.fs.free_map.release(sector);
            return Err(e);
        }
        if let Err(e) = parent.add(&name, sector, true) {
            // `directory::create_on_disk` already allocated the directory's
            // initial data sector and wrote `.`/`..` into it — same leak as
            // `try_create`'s `parent.add` failure above.
            crate::inode::destroy_on_disk(&self.fs.cache, &self.fs.free_map, sector);
            return Err(e);
        }
        Ok(())
    }

    /// Creates a new, empty directory at `path`.
    pub fn mkdir(&self, path: &str) -> bool {
        self.try_mkdir(path).is_ok()
    }

    fn try_chdir(&self, path: &str) -> FsResult<()> {
        let (parent_path, name) = split_for_resolve(path);
        let current = self.cwd.lock().unwrap();
        let target = if name.is_empty() {
            directory::resolve(&self.fs, &current, &parent_path)?
        } else {
            let parent = directory::resolve(&self.fs, &current, &parent_path)?;
            let entry = parent.lookup(&name).ok_or(FsError::NotFound)?;
            if !entry.is_dir {
                return Err(FsError::NotADirectory);
            }
            Directory::open(&self.fs, entry.inode_sector)
        };
        drop(current);
        *self.cwd.lock().unwrap() = target;
        Ok(())
    }

    /// Changes this session's current directory.
    pub fn chdir(&self, path: &str) -> bool {
        self.try_chdir(path).is_ok()
    }

    /// Resets the shared buffer cache. Affects every session over this
    /// mount, not just this one.
    pub fn cache_reset(&self) {
        self.fs.cache.reset();
    }

    /// Integer cache hit percentage since the last reset.
    pub fn hit_rate(&self) -> i32 {
        self.fs.cache.hit_rate()
    }

    /// Number of sector writes that have reached the device since mount.
    pub fn write_cnt(&self) -> u64 {
        self.fs.device.write_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn fresh(num_sectors: usize) -> FileSystem {
        FileSystem::format(Arc::new(MemoryDevice::new(num_sectors)))
    }

    #[test]
    fn create_open_write_read_round_trip() {
        let fs = fresh(256);
        let session = fs.session();
        assert!(session.create("/greeting.txt", 0));

        let (handle, is_dir) = session.open("/greeting.txt").unwrap();
        assert!(!is_dir);
        assert_eq!(handle.write(b"hello").unwrap(), 5);
        handle.seek(0);
        let mut buf = [0u8; 5];
        assert_eq!(handle.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mkdir_chdir_relative_create() {
        let fs = fresh(256);
        let session = fs.session();
        assert!(session.mkdir("/sub"));
        assert!(session.chdir("/sub"));
        assert!(session.create("relative.txt", 0));
        let (_handle, is_dir) = session.open("/sub/relative.txt").unwrap();
        assert!(!is_dir);
    }

    #[test]
    fn remove_while_open_frees_on_last_close() {
        let fs = fresh(256);
        let session = fs.session();
        session.create("/f", 0);
        let (handle, _) = session.open("/f").unwrap();
        assert!(session.remove("/f"));
        // still usable through the existing handle
        assert_eq!(handle.write(b"x").unwrap(), 1);
        assert!(session.open("/f").is_none());
    }

    #[test]
    fn double_create_fails() {
        let fs = fresh(256);
        let session = fs.session();
        assert!(session.create("/dup", 0));
        assert!(!session.create("/dup", 0));
    }

    #[test]
    fn hit_rate_improves_on_repeat_reads() {
        let fs = fresh(256);
        let session = fs.session();
        session.create("/f", 512);
        let (handle, _) = session.open("/f").unwrap();
        let mut buf = [0u8; 4];
        for _ in 0..5 {
            handle.seek(0);
            handle.read(&mut buf).unwrap();
        }
        assert!(session.hit_rate() > 0);
    }

    #[test]
    fn independent_sessions_have_independent_cwd() {
        let fs = fresh(256);
        let a = fs.session();
        let b = fs.session();
        assert!(a.mkdir("/only_a_cds_here"));
        assert!(a.chdir("/only_a_cds_here"));
        assert!(a.create("local.txt", 0));
        assert!(b.open("/only_a_cds_here/local.txt").is_some());
        assert!(b.open("local.txt").is_none());
    }

    #[test]
    fn close_then_mount_preserves_contents() {
        let device = Arc::new(MemoryDevice::new(256));
        {
            let fs = FileSystem::format(device.clone());
            let session = fs.session();
            session.create("/persisted.txt", 0);
            let (handle, _) = session.open("/persisted.txt").unwrap();
            handle.write(b"durable").unwrap();
            fs.close();
        }
        let fs = FileSystem::mount(device);
        let session = fs.session();
        let (handle, _) = session.open("/persisted.txt").unwrap();
        let mut buf = [0u8; 7];
        handle.read(&mut buf).unwrap();
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn byte_at_a_time_io_coalesces_into_sector_writes() {
        // spec.md §8 scenario 1: 64 KiB written one byte at a time, then
        // read back one byte at a time, must reach the device as far
        // fewer writes than bytes touched — the cache absorbs per-byte
        // writes into per-sector ones instead of passing every byte
        // through to the device.
        let device = Arc::new(MemoryDevice::new(512));
        let fs = FileSystem::format(device.clone());
        let session = fs.session();
        session.create("/file0", 0);
        let (handle, _) = session.open("/file0").unwrap();

        let writes_before = device.write_count();
        for i in 0..65536u32 {
            handle.write(&[i as u8]).unwrap();
        }
        handle.seek(0);
        let mut byte = [0u8; 1];
        for _ in 0..65536 {
            handle.read(&mut byte);
        }
        let writes_after = device.write_count() - writes_before;
        assert!(
            writes_after < 1000,
            "expected the cache to coalesce 65536 byte writes into well under 1000 device writes, got {writes_after}"
        );
    }

    #[test]
    fn open_empty_path_fails() {
        let fs = fresh(256);
        let session = fs.session();
        assert!(session.open("").is_none());
    }

    #[test]
    fn open_root_yields_directory_handle() {
        let fs = fresh(256);
        let session = fs.session();
        let (handle, is_dir) = session.open("/").unwrap();
        assert!(is_dir);
        assert_eq!(handle.inumber(), crate::layout::ROOT_DIR_SECTOR);
    }

    #[test]
    fn remove_open_directory_elsewhere_fails_but_regular_file_succeeds() {
        let fs = fresh(256);
        let session = fs.session();
        assert!(session.mkdir("/d"));
        let (_held_dir, _) = session.open("/d").unwrap();
        assert!(!session.remove("/d"));

        assert!(session.create("/f", 0));
        let (_held_file, _) = session.open("/f").unwrap();
        assert!(session.remove("/f"));
    }
}
