#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rowfs::fs::ops::Dispatcher;
use rowfs::store::{JournalMode, Store};

/// A dispatcher over a private in-memory store.
pub fn memory_fs() -> Dispatcher {
    Dispatcher::new(Arc::new(Store::in_memory().expect("open in-memory store")))
}

/// A database file shared by several "mounts", each with its own connection,
/// the way separate rowfs processes would share it.
pub struct SharedDb {
    pub dir: tempfile::TempDir,
}

impl SharedDb {
    pub fn new() -> Self {
        SharedDb {
            dir: tempfile::tempdir().expect("failed to create db dir"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("rowfs.db")
    }

    /// Open a new independent connection to the shared database.
    pub fn connect(&self) -> Dispatcher {
        self.connect_with(JournalMode::Wal)
    }

    /// Like [`SharedDb::connect`] with an explicit journal mode.
    pub fn connect_with(&self, journal_mode: JournalMode) -> Dispatcher {
        let store = Store::open(self.path(), Duration::from_secs(5), journal_mode)
            .expect("open shared store");
        Dispatcher::new(Arc::new(store))
    }
}

/// Path to the built rowfs binary.
pub fn rowfs_binary() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_rowfs"))
}
