//! Filesystem operations against the store.
//!
//! Each public method is one logical operation: it validates first, then
//! mutates inside a single transaction, so a failure never leaves a partial
//! change behind. Nothing is cached here; every call re-reads the database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::path::{self, ROOT};
use crate::error::{FsError, Result};
use crate::store::{FileKind, FileRecord, LockRecord, Store, Txn};

/// Largest file the store will hold (SQLite's default blob limit).
pub const MAX_FILE_SIZE: u64 = 1_000_000_000;

/// Permission bits kept from a caller-supplied mode.
const PERM_MASK: u32 = 0o7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    Read,
    Write,
    ReadWrite,
}

impl OpenIntent {
    pub fn from_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenIntent::Write,
            libc::O_RDWR => OpenIntent::ReadWrite,
            _ => OpenIntent::Read,
        }
    }

    pub fn writes(self) -> bool {
        self != OpenIntent::Read
    }
}

/// What `open` hands back; `release` takes it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub path: String,
    pub holder: String,
    pub intent: OpenIntent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileKind,
    pub name: String,
}

/// Attribute changes applied together by [`Dispatcher::set_attr`].
#[derive(Debug, Clone, Default)]
pub struct AttrChanges {
    pub perm: Option<u32>,
    pub size: Option<u64>,
    pub accessed_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<Store>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn getattr(&self, path: &str) -> Result<FileRecord> {
        path::validate(path)?;
        self.store.read(|tx| require(tx, path))
    }

    pub fn getattr_ino(&self, ino: u64) -> Result<FileRecord> {
        self.store.read(|tx| {
            tx.get_by_ino(ino)?
                .ok_or_else(|| FsError::NotFound(format!("inode {}", ino)))
        })
    }

    /// Resolve `name` inside directory `parent`.
    pub fn lookup(&self, parent: &str, name: &str) -> Result<FileRecord> {
        path::validate_name(name)?;
        self.getattr(&path::join(parent, name))
    }

    pub fn mkdir(&self, path: &str, perm: u32) -> Result<FileRecord> {
        let mode = FileKind::Directory.type_bits() | (perm & PERM_MASK);
        self.insert_child(path, mode, 2)
    }

    pub fn create(&self, path: &str, perm: u32) -> Result<FileRecord> {
        let mode = FileKind::RegularFile.type_bits() | (perm & PERM_MASK);
        self.insert_child(path, mode, 1)
    }

    /// Create a regular file and open it, as one transaction. With write
    /// intent the lock is taken before anything commits, so a conflicting
    /// lock leaves no file behind.
    pub fn create_open(
        &self,
        path: &str,
        perm: u32,
        intent: OpenIntent,
        holder: &str,
    ) -> Result<(FileRecord, OpenFile)> {
        path::validate(path)?;
        let mode = FileKind::RegularFile.type_bits() | (perm & PERM_MASK);
        let now = Utc::now();
        let record = self.store.transact(|tx| {
            let record = insert_under_parent(tx, path, mode, 1, now)?;
            if intent.writes() {
                lock_for_write(tx, path, holder, now)?;
            }
            Ok(record)
        })?;
        debug!("Created and opened {} (ino {}) for {}", path, record.ino, holder);
        let file = OpenFile {
            path: path.to_string(),
            holder: holder.to_string(),
            intent,
        };
        Ok((record, file))
    }

    fn insert_child(&self, path: &str, mode: u32, link_count: u32) -> Result<FileRecord> {
        path::validate(path)?;
        let now = Utc::now();
        let record = self
            .store
            .transact(|tx| insert_under_parent(tx, path, mode, link_count, now))?;
        debug!("Created {} (ino {}, mode {:o})", path, record.ino, mode);
        Ok(record)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        path::validate(path)?;
        self.store.transact(|tx| {
            let record = require(tx, path)?;
            if record.is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            tx.delete(path)?;
            if let Some(lock) = tx.lock_of(path)? {
                tx.force_release_lock(path)?;
                debug!("Dropped lock held by {} on unlinked {}", lock.holder, path);
            }
            Self::detach_from_parent(tx, path)
        })
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        path::validate(path)?;
        if path == ROOT {
            return Err(FsError::Busy(path.to_string()));
        }
        self.store.transact(|tx| {
            let record = require(tx, path)?;
            if !record.is_dir() {
                return Err(FsError::NotADirectory(path.to_string()));
            }
            if tx.has_descendants(path)? {
                return Err(FsError::NotEmpty(path.to_string()));
            }
            tx.delete(path)?;
            Self::detach_from_parent(tx, path)
        })
    }

    fn detach_from_parent(tx: &Txn<'_>, path: &str) -> Result<()> {
        let parent = path::parent_of(path);
        if !tx.adjust_link_count(parent, -1, Utc::now())? {
            warn!("Removed {} but its parent {} has no record", path, parent);
        }
        Ok(())
    }

    /// `.`, `..`, then the immediate children of `path` in creation order.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        path::validate(path)?;
        self.store.read(|tx| {
            let dir = require(tx, path)?;
            if !dir.is_dir() {
                return Err(FsError::NotADirectory(path.to_string()));
            }
            let parent_ino = if path == ROOT {
                dir.ino
            } else {
                tx.get(path::parent_of(path))?.map_or(dir.ino, |p| p.ino)
            };

            let mut entries = vec![
                DirEntry {
                    ino: dir.ino,
                    kind: FileKind::Directory,
                    name: ".".to_string(),
                },
                DirEntry {
                    ino: parent_ino,
                    kind: FileKind::Directory,
                    name: "..".to_string(),
                },
            ];
            entries.extend(
                tx.descendants_of(path)?
                    .into_iter()
                    .filter(|r| path::is_immediate_child(&r.path, path))
                    .map(|r| DirEntry {
                        ino: r.ino,
                        kind: r.kind(),
                        name: path::basename(&r.path).to_string(),
                    }),
            );
            Ok(entries)
        })
    }

    /// Up to `size` bytes at `offset`; short or empty past the end.
    pub fn read(&self, path: &str, size: u32, offset: u64) -> Result<Vec<u8>> {
        path::validate(path)?;
        self.store.read(|tx| {
            tx.read_range(path, offset, size)?
                .ok_or_else(|| FsError::NotFound(path.to_string()))
        })
    }

    /// Overwrite `data` at `offset`, zero-filling any gap past the current
    /// end. Returns the number of bytes written.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        path::validate(path)?;
        let end = offset.saturating_add(data.len() as u64);
        if end > MAX_FILE_SIZE {
            return Err(FsError::TooLarge(path.to_string()));
        }
        self.store.transact(|tx| {
            let record = require(tx, path)?;
            if record.is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            let mut content = tx.content(path)?.unwrap_or_default();
            splice(&mut content, offset as usize, data);
            tx.set_content(path, &content, Utc::now())?;
            Ok(data.len())
        })
    }

    pub fn truncate(&self, path: &str, length: u64) -> Result<FileRecord> {
        self.set_attr(
            path,
            AttrChanges {
                size: Some(length),
                ..Default::default()
            },
        )
    }

    pub fn set_mode(&self, path: &str, perm: u32) -> Result<FileRecord> {
        self.set_attr(
            path,
            AttrChanges {
                perm: Some(perm),
                ..Default::default()
            },
        )
    }

    pub fn set_times(
        &self,
        path: &str,
        accessed_at: Option<DateTime<Utc>>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<FileRecord> {
        self.set_attr(
            path,
            AttrChanges {
                accessed_at,
                modified_at,
                ..Default::default()
            },
        )
    }

    /// Apply a batch of attribute changes in one transaction. A size change
    /// cuts the content or zero-extends it to exactly `size` bytes.
    pub fn set_attr(&self, path: &str, changes: AttrChanges) -> Result<FileRecord> {
        path::validate(path)?;
        if changes.size.is_some_and(|s| s > MAX_FILE_SIZE) {
            return Err(FsError::TooLarge(path.to_string()));
        }
        self.store.transact(|tx| {
            let record = require(tx, path)?;
            if let Some(length) = changes.size {
                if record.is_dir() {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                let mut content = tx.content(path)?.unwrap_or_default();
                content.resize(length as usize, 0);
                tx.set_content(path, &content, Utc::now())?;
            }
            if let Some(perm) = changes.perm {
                tx.set_mode(path, record.kind().type_bits() | (perm & PERM_MASK))?;
            }
            if changes.accessed_at.is_some() || changes.modified_at.is_some() {
                tx.set_times(path, changes.accessed_at, changes.modified_at)?;
            }
            require(tx, path)
        })
    }

    /// Open `path`. Write intent takes the path's exclusive lock for
    /// `holder`; if anyone already holds it the open is refused.
    pub fn open(&self, path: &str, intent: OpenIntent, holder: &str) -> Result<OpenFile> {
        path::validate(path)?;
        if intent.writes() {
            self.store.transact(|tx| {
                let record = require(tx, path)?;
                if record.is_dir() {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                lock_for_write(tx, path, holder, Utc::now())
            })?;
        } else {
            self.store.read(|tx| require(tx, path))?;
        }
        Ok(OpenFile {
            path: path.to_string(),
            holder: holder.to_string(),
            intent,
        })
    }

    /// Best-effort unlock on close. Never fails.
    pub fn release(&self, file: &OpenFile) {
        if !file.intent.writes() {
            return;
        }
        match self
            .store
            .transact(|tx| tx.release_lock(&file.path, &file.holder))
        {
            Ok(()) => {}
            Err(e @ (FsError::NotLocked(_) | FsError::NotOwner { .. })) => {
                debug!("Ignoring unlock failure on release: {}", e);
            }
            Err(e) => warn!("Failed to release lock on {}: {}", file.path, e),
        }
    }

    pub fn locks(&self) -> Result<Vec<LockRecord>> {
        self.store.read(|tx| tx.list_locks())
    }

    /// Administrative unlock. With a holder it behaves like a normal
    /// release; without one it removes the lock whoever holds it.
    pub fn unlock(&self, path: &str, holder: Option<&str>) -> Result<()> {
        path::validate(path)?;
        match holder {
            Some(holder) => self.store.transact(|tx| tx.release_lock(path, holder)),
            None => {
                let lock = self.store.transact(|tx| tx.force_release_lock(path))?;
                info!("Force-released lock on {} held by {}", path, lock.holder);
                Ok(())
            }
        }
    }

    /// Force-release every lock older than `max_age`.
    pub fn sweep_stale_locks(&self, max_age: Duration) -> Result<Vec<LockRecord>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| FsError::Config(format!("lock max age: {}", e)))?;
        let cutoff = Utc::now() - max_age;
        let swept = self.store.transact(|tx| tx.sweep_locks(cutoff))?;
        for lock in &swept {
            warn!(
                "Swept stale lock on {} held by {} since {}",
                lock.path,
                lock.holder,
                lock.acquired_at.to_rfc3339()
            );
        }
        Ok(swept)
    }
}

/// Insert a record under an existing directory and count it in the parent.
fn insert_under_parent(
    tx: &Txn<'_>,
    path: &str,
    mode: u32,
    link_count: u32,
    now: DateTime<Utc>,
) -> Result<FileRecord> {
    if path == ROOT {
        return Err(FsError::AlreadyExists(path.to_string()));
    }
    let parent = path::parent_of(path);
    let parent_rec = tx
        .get(parent)?
        .ok_or_else(|| FsError::ParentNotFound(parent.to_string()))?;
    if !parent_rec.is_dir() {
        return Err(FsError::NotADirectory(parent.to_string()));
    }
    if !tx.insert_if_absent(path, mode, link_count, now)? {
        return Err(FsError::AlreadyExists(path.to_string()));
    }
    tx.adjust_link_count(parent, 1, now)?;
    require(tx, path)
}

/// Take the write lock; someone else holding it means the open is refused.
fn lock_for_write(tx: &Txn<'_>, path: &str, holder: &str, now: DateTime<Utc>) -> Result<()> {
    match tx.acquire_lock(path, holder, now) {
        Err(FsError::AlreadyLocked { path, holder }) => Err(FsError::AccessDenied { path, holder }),
        other => other,
    }
}

fn require(tx: &Txn<'_>, path: &str) -> Result<FileRecord> {
    tx.get(path)?
        .ok_or_else(|| FsError::NotFound(path.to_string()))
}

/// `content[..offset] + data + content[offset + data.len()..]`, with zeros
/// between the old end and `offset`.
pub(crate) fn splice(content: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if content.len() < end {
        content.resize(end, 0);
    }
    content[offset..end].copy_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(Store::in_memory().unwrap()))
    }

    #[test]
    fn test_splice() {
        let mut c = b"hello".to_vec();
        splice(&mut c, 1, b"EL");
        assert_eq!(c, b"hELlo");

        let mut c = b"ab".to_vec();
        splice(&mut c, 1, b"XYZ");
        assert_eq!(c, b"aXYZ");

        let mut c = Vec::new();
        splice(&mut c, 3, b"X");
        assert_eq!(c, b"\0\0\0X");
    }

    #[test]
    fn test_open_intent_from_flags() {
        assert_eq!(OpenIntent::from_flags(libc::O_RDONLY), OpenIntent::Read);
        assert_eq!(
            OpenIntent::from_flags(libc::O_WRONLY | libc::O_TRUNC),
            OpenIntent::Write
        );
        assert_eq!(OpenIntent::from_flags(libc::O_RDWR), OpenIntent::ReadWrite);
        assert!(!OpenIntent::Read.writes());
        assert!(OpenIntent::ReadWrite.writes());
    }

    #[test]
    fn test_create_under_file_is_rejected() {
        let fs = dispatcher();
        fs.create("/f", 0o644).unwrap();
        assert!(matches!(
            fs.create("/f/g", 0o644),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.mkdir("/missing/d", 0o755),
            Err(FsError::ParentNotFound(_))
        ));
    }

    #[test]
    fn test_kind_checks() {
        let fs = dispatcher();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/f", 0o644).unwrap();
        assert!(matches!(fs.unlink("/d"), Err(FsError::IsADirectory(_))));
        assert!(matches!(fs.rmdir("/f"), Err(FsError::NotADirectory(_))));
        assert!(matches!(fs.rmdir("/"), Err(FsError::Busy(_))));
        assert!(matches!(fs.readdir("/f"), Err(FsError::NotADirectory(_))));
        assert!(matches!(
            fs.write("/d", b"x", 0),
            Err(FsError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_set_mode_keeps_type_bits() {
        let fs = dispatcher();
        fs.create("/f", 0o644).unwrap();
        let rec = fs.set_mode("/f", 0o600).unwrap();
        assert_eq!(rec.kind(), FileKind::RegularFile);
        assert_eq!(rec.perm(), 0o600);
    }

    #[test]
    fn test_unlink_drops_lock() {
        let fs = dispatcher();
        fs.create("/f", 0o644).unwrap();
        let handle = fs.open("/f", OpenIntent::Write, "a").unwrap();
        fs.unlink("/f").unwrap();
        assert!(fs.locks().unwrap().is_empty());
        // Release after unlink is swallowed.
        fs.release(&handle);
    }

    #[test]
    fn test_write_past_limit() {
        let fs = dispatcher();
        fs.create("/f", 0o644).unwrap();
        assert!(matches!(
            fs.write("/f", b"x", MAX_FILE_SIZE),
            Err(FsError::TooLarge(_))
        ));
    }
}
