//! `sectorfs`: an educational on-disk file system over a 512-byte-sector
//! block device.
//!
//! Four layers, each built on the one below:
//! - [`device`]: the block device abstraction and two concrete backends.
//! - [`cache`]: a fixed-capacity, clock-replacement, write-back buffer
//!   cache sitting in front of the device.
//! - [`free_map`] and [`inode`]: the sector allocator and the indexed,
//!   sparse-growable inode built on it.
//! - [`directory`]: directories as inodes whose contents are entry
//!   arrays, with slash-separated path resolution.
//!
//! [`fs`] ties these into the public surface: [`FileSystem`] for
//! `format`/`mount`/`close`, and [`Session`] for the per-caller
//! create/open/remove/mkdir/chdir operations a process table would
//! otherwise drive.

mod cache;
mod device;
mod directory;
mod error;
mod free_map;
mod fs;
mod inode;
mod layout;
mod path;

pub use device::{BlockDevice, FileBackedDevice, MemoryDevice};
pub use directory::DirEntry;
pub use error::{FsError, FsResult};
pub use fs::{FileHandle, FileSystem, Handle, Session};
pub use path::split_path;
