//! Path arithmetic over the flat, path-keyed store.
//!
//! Nothing here touches the database. The directory tree is reconstructed from
//! path strings at query time: a record's parent is whatever its path says it
//! is, and a directory's children are the records whose parent is that
//! directory.

use crate::error::{FsError, Result};

pub const ROOT: &str = "/";
pub const SEPARATOR: char = '/';

/// Everything before the final separator, or `/` if that would be empty.
pub fn parent_of(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// The final path component. Empty for the root.
pub fn basename(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn is_immediate_child(candidate: &str, parent: &str) -> bool {
    candidate != ROOT && parent_of(candidate) == parent
}

/// Path of `name` inside directory `parent`.
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Prefix shared by every descendant of `path`.
pub fn descendant_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Validate a single directory entry name as handed to us by the kernel.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(SEPARATOR) {
        return Err(FsError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// Reject anything that is not an absolute, normalized path.
pub fn validate(path: &str) -> Result<()> {
    if path == ROOT {
        return Ok(());
    }
    if !path.starts_with(SEPARATOR) || path.ends_with(SEPARATOR) {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    for component in path[1..].split(SEPARATOR) {
        if component.is_empty() || component == "." || component == ".." {
            return Err(FsError::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}
