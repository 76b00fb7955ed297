use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ops::OpenFile;

#[derive(Debug, Clone)]
pub struct HandleState {
    /// The file handle ID given to the kernel.
    pub fh: u64,
    /// Path and lock holder this handle was opened with.
    pub file: OpenFile,
    /// Session ID of the process that opened this handle.
    pub sid: u32,
}

/// Files this mount currently has open. Lives only as long as the process;
/// the locks these handles hold live in the store.
pub struct HandleTable {
    handles: DashMap<u64, HandleState>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, file: OpenFile, sid: u32) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, HandleState { fh, file, sid });
        fh
    }

    pub fn get(&self, fh: u64) -> Option<HandleState> {
        self.handles.get(&fh).map(|h| h.value().clone())
    }

    pub fn remove(&self, fh: u64) -> Option<HandleState> {
        self.handles.remove(&fh).map(|(_, v)| v)
    }

    /// Snapshot of every open handle, ordered by handle ID.
    pub fn list_open(&self) -> Vec<HandleState> {
        let mut open: Vec<HandleState> = self.handles.iter().map(|h| h.value().clone()).collect();
        open.sort_by_key(|h| h.fh);
        open
    }

    /// Remove and return every open handle.
    pub fn drain(&self) -> Vec<HandleState> {
        let fhs: Vec<u64> = self.handles.iter().map(|h| *h.key()).collect();
        let mut drained: Vec<HandleState> = fhs.into_iter().filter_map(|fh| self.remove(fh)).collect();
        drained.sort_by_key(|h| h.fh);
        drained
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
