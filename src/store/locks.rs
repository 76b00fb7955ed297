use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use super::{from_micros, to_micros, Txn};
use crate::error::{FsError, Result};

/// One advisory exclusive lock. Present iff a writer holds the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub path: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LockInfo {
    pub path: String,
    pub holder: String,
    pub acquired_at: String,
}

impl LockRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(LockRecord {
            path: row.get(0)?,
            holder: row.get(1)?,
            acquired_at: from_micros(row.get(2)?),
        })
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            path: self.path.clone(),
            holder: self.holder.clone(),
            acquired_at: self.acquired_at.to_rfc3339(),
        }
    }
}

impl Txn<'_> {
    pub fn lock_of(&self, path: &str) -> Result<Option<LockRecord>> {
        let lock = self
            .conn()
            .query_row(
                "SELECT path, holder, acquired_at FROM locks WHERE path = ?1",
                params![path],
                LockRecord::from_row,
            )
            .optional()?;
        Ok(lock)
    }

    pub fn is_locked(&self, path: &str) -> Result<bool> {
        Ok(self.lock_of(path)?.is_some())
    }

    /// Take the lock on `path` for `holder`. Fails if anyone holds it,
    /// including `holder` itself.
    pub fn acquire_lock(&self, path: &str, holder: &str, now: DateTime<Utc>) -> Result<()> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO locks (path, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![path, holder, to_micros(now)],
        )?;
        if inserted == 1 {
            debug!("Lock acquired on {} by {}", path, holder);
            return Ok(());
        }
        let current = self
            .lock_of(path)?
            .map(|l| l.holder)
            .unwrap_or_default();
        Err(FsError::AlreadyLocked {
            path: path.to_string(),
            holder: current,
        })
    }

    pub fn release_lock(&self, path: &str, holder: &str) -> Result<()> {
        let lock = self
            .lock_of(path)?
            .ok_or_else(|| FsError::NotLocked(path.to_string()))?;
        if lock.holder != holder {
            return Err(FsError::NotOwner {
                path: path.to_string(),
                holder: lock.holder,
                caller: holder.to_string(),
            });
        }
        self.conn().execute(
            "DELETE FROM locks WHERE path = ?1 AND holder = ?2",
            params![path, holder],
        )?;
        debug!("Lock released on {} by {}", path, holder);
        Ok(())
    }

    /// Remove the lock on `path` whoever holds it.
    pub fn force_release_lock(&self, path: &str) -> Result<LockRecord> {
        let lock = self
            .lock_of(path)?
            .ok_or_else(|| FsError::NotLocked(path.to_string()))?;
        self.conn()
            .execute("DELETE FROM locks WHERE path = ?1", params![path])?;
        Ok(lock)
    }

    pub fn list_locks(&self) -> Result<Vec<LockRecord>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT path, holder, acquired_at FROM locks ORDER BY acquired_at, path")?;
        let rows = stmt.query_map([], LockRecord::from_row)?;
        let locks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(locks)
    }

    /// Delete and return every lock acquired before `cutoff`.
    pub fn sweep_locks(&self, cutoff: DateTime<Utc>) -> Result<Vec<LockRecord>> {
        let cutoff = to_micros(cutoff);
        let stale = {
            let mut stmt = self.conn().prepare(
                "SELECT path, holder, acquired_at FROM locks WHERE acquired_at < ?1 ORDER BY path",
            )?;
            let rows = stmt.query_map(params![cutoff], LockRecord::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        self.conn()
            .execute("DELETE FROM locks WHERE acquired_at < ?1", params![cutoff])?;
        Ok(stale)
    }
}
