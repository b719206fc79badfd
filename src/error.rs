//! Error taxonomy for the file system core.
//!
//! Only the non-fatal half of spec's error taxonomy is represented here:
//! not-found, invalid-argument, quota, and conflict failures all surface as
//! a typed `FsError` that callers can inspect or collapse to a bare `bool`.
//! Fatal failures (device I/O errors, an inode whose magic doesn't match)
//! are not part of this enum — they panic at the point of detection, same
//! as an unrecoverable assertion in the original C implementation.

use thiserror::Error;

/// Non-fatal failure of a file system operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// A path component, directory entry, or handle did not resolve.
    #[error("no such file or directory")]
    NotFound,

    /// A caller-supplied argument violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The free-map has no clear bits left.
    #[error("device has no free sectors")]
    NoSpace,

    /// `add` was called with a name that already has an entry.
    #[error("a file or directory by that name already exists")]
    AlreadyExists,

    /// `remove` was called on a non-empty directory.
    #[error("directory is not empty")]
    NotEmpty,

    /// `remove` was called on a directory that some other handle still has
    /// open.
    #[error("directory is open elsewhere")]
    Busy,

    /// An operation that only makes sense on a directory was applied to a
    /// regular file handle, or vice versa.
    #[error("is a directory")]
    IsADirectory,

    /// An operation that only makes sense on a regular file was applied to
    /// a directory handle.
    #[error("not a directory")]
    NotADirectory,
}

/// Convenience alias used throughout the crate's internal plumbing.
pub type FsResult<T> = Result<T, FsError>;
