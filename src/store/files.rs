use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{from_micros, to_micros, Txn};
use crate::error::Result;
use crate::fs::path;

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;

const RECORD_COLUMNS: &str =
    "id, path, mode, link_count, size, created_at, modified_at, accessed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
}

impl FileKind {
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Directory => S_IFDIR,
            FileKind::RegularFile => S_IFREG,
        }
    }

    /// Anything that is not a directory is served as a regular file.
    pub fn from_mode(mode: u32) -> Self {
        if mode & S_IFMT == S_IFDIR {
            FileKind::Directory
        } else {
            FileKind::RegularFile
        }
    }
}

/// Metadata for one path. Content is loaded separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub ino: u64,
    pub path: String,
    pub mode: u32,
    pub link_count: u32,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn perm(&self) -> u32 {
        self.mode & !S_IFMT
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let ino: i64 = row.get(0)?;
        let size: i64 = row.get(4)?;
        Ok(FileRecord {
            ino: ino as u64,
            path: row.get(1)?,
            mode: row.get(2)?,
            link_count: row.get(3)?,
            size: size as u64,
            created_at: from_micros(row.get(5)?),
            modified_at: from_micros(row.get(6)?),
            accessed_at: from_micros(row.get(7)?),
        })
    }
}

impl Txn<'_> {
    pub fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let record = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM files WHERE path = ?1", RECORD_COLUMNS),
                params![path],
                FileRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_by_ino(&self, ino: u64) -> Result<Option<FileRecord>> {
        let record = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM files WHERE id = ?1", RECORD_COLUMNS),
                params![ino as i64],
                FileRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a fresh, empty record. Returns false if the path already exists.
    pub fn insert_if_absent(
        &self,
        path: &str,
        mode: u32,
        link_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = to_micros(now);
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO files
                (path, mode, link_count, size, created_at, modified_at, accessed_at, content)
             VALUES (?1, ?2, ?3, 0, ?4, ?4, ?4, x'')",
            params![path, mode, link_count, now],
        )?;
        Ok(inserted == 1)
    }

    pub fn delete(&self, path: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(deleted == 1)
    }

    /// Every record below `dir`, in insertion order.
    pub fn descendants_of(&self, dir: &str) -> Result<Vec<FileRecord>> {
        let prefix = path::descendant_prefix(dir);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM files
             WHERE path != '/' AND substr(path, 1, ?2) = ?1
             ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![prefix, prefix.chars().count() as i64],
            FileRecord::from_row,
        )?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn has_descendants(&self, dir: &str) -> Result<bool> {
        let prefix = path::descendant_prefix(dir);
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM files
                 WHERE path != '/' AND substr(path, 1, ?2) = ?1
                 LIMIT 1",
                params![prefix, prefix.chars().count() as i64],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Whole content of a record, or None if the path does not exist.
    pub fn content(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let content = self
            .conn()
            .query_row(
                "SELECT content FROM files WHERE path = ?1",
                params![path],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(content)
    }

    /// `size` bytes starting at `offset`, sliced inside the database so the
    /// whole blob is never loaded for a small read.
    pub fn read_range(&self, path: &str, offset: u64, size: u32) -> Result<Option<Vec<u8>>> {
        // substr is 1-based; an offset with no i64 start is past any blob.
        let Some(start) = i64::try_from(offset).ok().and_then(|o| o.checked_add(1)) else {
            return Ok(self.get(path)?.map(|_| Vec::new()));
        };
        let data = self
            .conn()
            .query_row(
                "SELECT substr(content, ?2, ?3) FROM files WHERE path = ?1",
                params![path, start, size as i64],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?;
        Ok(data.map(Option::unwrap_or_default))
    }

    /// Replace content; size follows it.
    pub fn set_content(&self, path: &str, content: &[u8], now: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE files SET content = ?2, size = ?3, modified_at = ?4 WHERE path = ?1",
            params![path, content, content.len() as i64, to_micros(now)],
        )?;
        Ok(updated == 1)
    }

    /// Add `delta` to the link count and stamp the modification time.
    pub fn adjust_link_count(&self, path: &str, delta: i64, now: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE files SET link_count = link_count + ?2, modified_at = ?3 WHERE path = ?1",
            params![path, delta, to_micros(now)],
        )?;
        Ok(updated == 1)
    }

    pub fn set_mode(&self, path: &str, mode: u32) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE files SET mode = ?2 WHERE path = ?1",
            params![path, mode],
        )?;
        Ok(updated == 1)
    }

    /// Update whichever timestamps are given, leaving the others alone.
    pub fn set_times(
        &self,
        path: &str,
        accessed_at: Option<DateTime<Utc>>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE files
             SET accessed_at = COALESCE(?2, accessed_at),
                 modified_at = COALESCE(?3, modified_at)
             WHERE path = ?1",
            params![path, accessed_at.map(to_micros), modified_at.map(to_micros)],
        )?;
        Ok(updated == 1)
    }
}
