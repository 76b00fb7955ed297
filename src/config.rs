use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FsError, Result};
use crate::store::{JournalMode, Store};

#[derive(Parser, Debug)]
#[command(
    name = "rowfs",
    about = "FUSE filesystem stored in a shared SQLite database, with advisory write locks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Where the shared database lives.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Path to the SQLite database shared by every mount
    #[arg(long, env = "ROWFS_DATABASE", default_value = "rowfs.db")]
    pub database: PathBuf,

    /// Milliseconds to wait on another process's write transaction
    #[arg(long, env = "ROWFS_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout_ms: u64,

    /// SQLite journal mode: wal for mounts on one host, delete when the
    /// database sits on storage shared between hosts
    #[arg(long, env = "ROWFS_JOURNAL_MODE", default_value_t = JournalMode::Wal)]
    pub journal_mode: JournalMode,
}

impl StoreArgs {
    pub fn open(&self) -> Result<Arc<Store>> {
        let store = Store::open(
            &self.database,
            Duration::from_millis(self.busy_timeout_ms),
            self.journal_mode,
        )?;
        Ok(Arc::new(store))
    }
}

/// A lock age given in minutes on the command line.
pub fn lock_age(minutes: u64) -> Result<Duration> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| FsError::Config(format!("lock age of {} minutes is too large", minutes)))
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount a rowfs filesystem
    Mount {
        /// Path to the mount point
        mountpoint: PathBuf,

        #[command(flatten)]
        store: StoreArgs,

        /// Identity used as the prefix of lock holders from this mount
        #[arg(long)]
        session_id: Option<String>,

        /// Log file path
        #[arg(long, default_value = "/tmp/rowfs.log")]
        log_file: PathBuf,

        /// Minutes after which a write lock is considered abandoned and
        /// swept (0 disables the sweep)
        #[arg(long, default_value_t = 60)]
        lock_max_age_minutes: u64,
    },
    /// Unmount a rowfs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
    /// Create the database schema and root directory
    Init {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Print the lock table as JSON
    Locks {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Remove a write lock
    Unlock {
        /// Absolute path inside the filesystem, e.g. /notes/todo.txt
        path: String,

        #[command(flatten)]
        store: StoreArgs,

        /// Only unlock if held by this holder (default: remove whoever holds it)
        #[arg(long)]
        holder: Option<String>,
    },
    /// Release every lock older than the given age
    Sweep {
        #[command(flatten)]
        store: StoreArgs,

        /// Maximum lock age in minutes
        #[arg(long)]
        max_age_minutes: u64,
    },
}

#[derive(Debug, Clone)]
pub struct RowfsConfig {
    pub database: PathBuf,
    pub mountpoint: PathBuf,
    pub session_id: String,
    pub log_file: PathBuf,
    pub lock_max_age_minutes: u64,
}
