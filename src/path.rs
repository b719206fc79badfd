//! Slash-separated path parsing, shared by the directory layer's
//! `resolve` and the facade's `split_path`-then-`resolve` pattern.
//!
//! Mirrors the teacher's `fs::path` module (a `Path`/`FileName` pair of
//! byte-slice newtypes with a `skipelem` iterator), generalized from
//! fixed-size on-disk path components to the crate's `&str` paths: the
//! underlying algorithm — skip a run of separators, take up to `NAME_MAX`
//! bytes, repeat — is identical, only the representation changed from an
//! unsafe `[u8]` newtype to a plain string slice since this crate runs in
//! userspace with an allocator always available.

use crate::error::{FsError, FsResult};
use crate::layout::NAME_MAX;

/// Extracts the next path component from `src`, skipping any leading run
/// of `/`. Returns `Ok(None)` at end of string, `Ok(Some((name, rest)))`
/// otherwise, and `Err` if the component is longer than `NAME_MAX` bytes.
///
/// Equivalent to the original `get_next_part`: `0` becomes `None`, `-1`
/// becomes `Err`, success becomes `Some`.
pub(crate) fn next_part(src: &str) -> FsResult<Option<(&str, &str)>> {
    let trimmed = src.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    let end = trimmed.find('/').unwrap_or(trimmed.len());
    if end > NAME_MAX {
        return Err(FsError::InvalidArgument("path component longer than NAME_MAX"));
    }
    Ok(Some((&trimmed[..end], &trimmed[end..])))
}

/// Splits `path` into a parent-directory path and a leaf name.
///
/// Trims the trailing run of `/`, then splits at the last remaining
/// separator run (not just the last single `/`, so repeated slashes like
/// `//a//b` split at the whole `//` run rather than leaving one behind in
/// the parent). A path that is nothing but separators (or empty) has no
/// leaf and is returned unchanged as its own "parent" — this is what lets
/// `split_path("/")` and `split_path("///")` both round-trip their input.
///
/// Documented cases (spec.md §4.5.2, §8 scenario 6):
/// - `"/"` → (`"/"`, `""`)
/// - `"a"` → (`""`, `"a"`)
/// - `"a/b/"` → (`"a"`, `"b"`)
/// - `"//a//b"` → (`"//a"`, `"b"`)
/// - `"///"` → (`"///"`, `""`)
pub fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return (path.to_string(), String::new());
    }
    match trimmed.rfind('/') {
        None => (String::new(), trimmed.to_string()),
        Some(sep_end) => {
            let bytes = trimmed.as_bytes();
            let mut sep_start = sep_end;
            while sep_start > 0 && bytes[sep_start - 1] == b'/' {
                sep_start -= 1;
            }
            (trimmed[..sep_start].to_string(), trimmed[sep_end + 1..].to_string())
        }
    }
}

/// `split_path`, adjusted for feeding straight into `resolve`.
///
/// `split_path` alone loses absoluteness for a single-component absolute
/// path: `split_path("/sub")` gives parent `""`, which `resolve` would
/// then (wrongly) treat as "start from the current directory". Since
/// `split_path`'s documented behavior (spec.md §4.5.2, §8 scenario 6) must
/// stay exactly as specified, this wrapper restores the leading `/` onto
/// an empty parent whenever the original path was itself absolute.
pub(crate) fn split_for_resolve(path: &str) -> (String, String) {
    let (parent, leaf) = split_path(path);
    if parent.is_empty() && path.starts_with('/') {
        ("/".to_string(), leaf)
    } else {
        (parent, leaf)
    }
}
