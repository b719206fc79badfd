//! On-disk layout constants shared by every layer of the file system.
//!
//! These mirror the fixed geometry of the Pintos-style disk this crate
//! models: 512-byte sectors, a 12-direct/1-indirect/1-double-indirect inode,
//! and 14-byte directory entry names. None of these are meant to be tuned at
//! runtime — only the device's sector *count* varies per `format`/`mount`.

use core::mem;

/// A device sector is this many bytes. Sector 0 is reserved as a null
/// pointer; it never holds inode or file data.
pub const SECTOR_SIZE: usize = 512;

/// Identifies a device sector. `0` means "no sector" throughout the crate.
pub type SectorIndex = u32;

/// The sentinel value meaning "no sector"/"unallocated pointer".
pub const NULL_SECTOR: SectorIndex = 0;

/// Number of direct pointers stored in an inode.
pub const NUM_DIRECT: usize = 12;

/// Number of sector pointers that fit in one indirect block.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / mem::size_of::<u32>();

/// Number of sectors reachable through the single indirect pointer.
pub const NUM_INDIRECT: usize = PTRS_PER_SECTOR;

/// Number of sectors reachable through the double indirect pointer.
pub const NUM_DBL_INDIRECT: usize = PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Total number of data sectors a single inode can address.
pub const MAX_FILE_SECTORS: usize = NUM_DIRECT + NUM_INDIRECT + NUM_DBL_INDIRECT;

/// Largest byte length a file can grow to (~8.06 MiB).
pub const MAX_FILE_SIZE: u64 = (MAX_FILE_SECTORS * SECTOR_SIZE) as u64;

/// Stamped into every inode once `inode_create`/`create_on_disk` finishes;
/// a mismatch on open means the disk image is corrupt or unformatted.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Maximum length, in bytes, of one path component.
pub const NAME_MAX: usize = 14;

/// Reserved sector holding the free-map's own inode.
pub const FREE_MAP_SECTOR: SectorIndex = 0;

/// Reserved sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: SectorIndex = 1;

/// Number of directory entries a freshly created directory has room for
/// before it needs to grow.
pub const DIR_INITIAL_ENTRIES: usize = 16;

/// Fixed number of slots in the buffer cache.
pub const CACHE_CAPACITY: usize = 64;

/// Rounds `size` bytes up to a whole number of sectors.
pub const fn bytes_to_sectors(size: u64) -> u64 {
    (size + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64
}
