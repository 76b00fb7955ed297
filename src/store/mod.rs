//! SQLite persistence for file records and advisory locks.
//!
//! The database is the only source of truth. Nothing is cached between calls:
//! every operation checks out the connection, runs inside one transaction and
//! commits or rolls back before returning.

pub mod files;
pub mod locks;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::Result;

pub use files::{FileKind, FileRecord};
pub use locks::{LockInfo, LockRecord};

/// Inode number of the root record.
pub const ROOT_INO: u64 = 1;

/// Permission bits given to the root directory when a store is first created.
pub const ROOT_PERM: u32 = 0o755;

const SCHEMA: &str = r#"
-- One row per path, directories included
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    mode INTEGER NOT NULL,
    link_count INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,
    accessed_at INTEGER NOT NULL,
    content BLOB NOT NULL DEFAULT x''
);

-- At most one writer per path
CREATE TABLE IF NOT EXISTS locks (
    path TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now', 'subsec') * 1000000 AS INTEGER))
);
"#;

/// SQLite journal mode for a database file.
///
/// WAL needs shared memory between every process touching the file, so it
/// only works when all mounts run on one host. A database on network storage
/// shared by several hosts must use a rollback journal (`Delete`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Truncate,
}

impl JournalMode {
    pub fn as_pragma(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_pragma().to_ascii_lowercase())
    }
}

impl FromStr for JournalMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wal" => Ok(JournalMode::Wal),
            "delete" => Ok(JournalMode::Delete),
            "truncate" => Ok(JournalMode::Truncate),
            other => Err(format!(
                "unknown journal mode '{}' (expected wal, delete or truncate)",
                other
            )),
        }
    }
}

/// Handle to the backing database.
pub struct Store {
    conn: Mutex<Connection>,
    location: String,
}

/// A single open transaction. Dropping it without [`Store::transact`]
/// reaching its commit rolls everything back.
pub struct Txn<'a> {
    tx: Transaction<'a>,
}

impl<'a> Txn<'a> {
    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl Store {
    /// Open or create a database file. Several processes may open the same
    /// file; SQLite serializes their write transactions.
    pub fn open<P: AsRef<Path>>(
        path: P,
        busy_timeout: Duration,
        journal_mode: JournalMode,
    ) -> Result<Self> {
        let location = path.as_ref().display().to_string();
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // journal_mode answers with the mode actually in effect.
        let wanted = journal_mode.as_pragma();
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", wanted, |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case(wanted) {
            warn!("{} is in {} journal mode, not {}", location, mode, wanted);
        }
        if journal_mode == JournalMode::Wal {
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        Self::init(&conn)?;
        debug!("Opened store at {}", location);
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location: ":memory:".to_string(),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        let now = to_micros(Utc::now());
        conn.execute(
            "INSERT OR IGNORE INTO files
                (id, path, mode, link_count, size, created_at, modified_at, accessed_at, content)
             VALUES (?1, '/', ?2, 2, 0, ?3, ?3, ?3, x'')",
            params![
                ROOT_INO as i64,
                FileKind::Directory.type_bits() | ROOT_PERM,
                now
            ],
        )?;
        Ok(())
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// The journal mode SQLite reports for this connection.
    pub fn journal_mode(&self) -> Result<String> {
        let conn = self.conn.lock();
        let mode = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode)
    }

    /// Run `f` inside a write transaction. `Ok` commits, `Err` rolls back.
    ///
    /// The transaction is opened `IMMEDIATE` so the database write lock is
    /// taken before any validation read, and another process cannot change
    /// what was validated before this transaction commits.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        self.run(TransactionBehavior::Immediate, f)
    }

    /// Run `f` inside a read transaction, giving it a consistent snapshot.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        self.run(TransactionBehavior::Deferred, f)
    }

    fn run<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(behavior)?;
        let txn = Txn { tx };
        match f(&txn) {
            Ok(value) => {
                txn.tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let crate::error::FsError::Io(ref db) = e {
                    warn!("Rolling back after store error: {}", db);
                }
                // Dropping the transaction rolls it back.
                drop(txn);
                Err(e)
            }
        }
    }
}

pub(crate) fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}
