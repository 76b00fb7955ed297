pub mod attr;
pub mod handles;
pub mod ops;
pub mod path;

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use fuser::{
    BsdFileFlags, Errno, FileHandle, FileType, Filesystem, FopenFlags, Generation, INodeNo,
    KernelConfig, LockOwner, OpenFlags, RenameFlags, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow, WriteFlags,
};
use tracing::{debug, error, info, warn};

use self::attr::{from_system_time, kind_to_filetype, record_to_file_attr};
use self::handles::HandleTable;
use self::ops::{AttrChanges, Dispatcher, OpenIntent};
use crate::config::RowfsConfig;
use crate::error::FsError;
use crate::store::Store;

const TTL: Duration = Duration::from_secs(1);

/// Get the session ID for a given PID. Falls back to the PID itself on error.
fn get_sid(pid: u32) -> u32 {
    let sid = unsafe { libc::getsid(pid as i32) };
    if sid < 0 { pid } else { sid as u32 }
}

/// Translate an operation error into the errno the kernel sees.
fn to_errno(e: &FsError) -> Errno {
    match e {
        FsError::Io(_) => error!("Store failure: {}", e),
        FsError::AccessDenied { .. } => warn!("{}", e),
        _ => debug!("{}", e),
    }
    raw_errno(e.errno())
}

fn raw_errno(code: libc::c_int) -> Errno {
    Errno::from(std::io::Error::from_raw_os_error(code))
}

fn name_str(name: &OsStr) -> Result<&str, Errno> {
    name.to_str().ok_or(Errno::EINVAL)
}

pub struct RowFs {
    pub config: RowfsConfig,
    /// Operations against the shared store.
    pub dispatcher: Dispatcher,
    /// Open file handle table.
    pub file_handles: Arc<HandleTable>,
}

impl RowFs {
    pub fn new(config: RowfsConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            dispatcher: Dispatcher::new(store),
            file_handles: Arc::new(HandleTable::new()),
        }
    }

    /// Lock holder identity for the process behind a request: this mount's
    /// session ID plus the caller's POSIX session.
    fn holder_for(&self, sid: u32) -> String {
        format!("{}:{}", self.config.session_id, sid)
    }

    fn path_of(&self, ino: INodeNo) -> Result<String, Errno> {
        self.dispatcher
            .getattr_ino(u64::from(ino))
            .map(|r| r.path)
            .map_err(|e| to_errno(&e))
    }

    /// Path of `name` inside directory inode `parent`.
    fn child_path(&self, parent: INodeNo, name: &OsStr) -> Result<String, Errno> {
        let parent = self.path_of(parent)?;
        let name = name_str(name)?;
        path::validate_name(name).map_err(|e| to_errno(&e))?;
        Ok(path::join(&parent, name))
    }

    /// Release every handle still open, dropping the locks they hold.
    pub fn release_all(&self) {
        for handle in self.file_handles.drain() {
            debug!("Releasing {} still open at shutdown", handle.file.path);
            self.dispatcher.release(&handle.file);
        }
    }
}

impl Filesystem for RowFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::io::Result<()> {
        info!(
            "rowfs filesystem initialized, database={}, session={}",
            self.dispatcher.store().location(),
            self.config.session_id
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("rowfs filesystem shutting down");
        self.release_all();
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", u64::from(parent), name);

        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.dispatcher.getattr(&path) {
            Ok(record) => reply.entry(&TTL, &record_to_file_attr(&record), Generation(0)),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        debug!("getattr(ino={})", u64::from(ino));

        match self.dispatcher.getattr_ino(u64::from(ino)) {
            Ok(record) => reply.attr(&TTL, &record_to_file_attr(&record)),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", u64::from(ino), mode, size);

        if uid.is_some() || gid.is_some() {
            // Ownership is not stored; every record belongs to the mounting user.
            reply.error(raw_errno(libc::EPERM));
            return;
        }

        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let resolve = |t: Option<TimeOrNow>| match t {
            Some(TimeOrNow::SpecificTime(st)) => Some(from_system_time(st)),
            Some(TimeOrNow::Now) => Some(Utc::now()),
            None => None,
        };
        let changes = AttrChanges {
            perm: mode,
            size,
            accessed_at: resolve(atime),
            modified_at: resolve(mtime),
        };

        match self.dispatcher.set_attr(&path, changes) {
            Ok(record) => reply.attr(&TTL, &record_to_file_attr(&record)),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:#o})", u64::from(parent), name, mode);

        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.dispatcher.mkdir(&path, mode & !umask) {
            Ok(record) => reply.entry(&TTL, &record_to_file_attr(&record), Generation(0)),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:#o})", u64::from(parent), name, mode);

        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let sid = get_sid(req.pid());
        let holder = self.holder_for(sid);
        match self.dispatcher.create_open(
            &path,
            mode & !umask,
            OpenIntent::from_flags(flags),
            &holder,
        ) {
            Ok((record, file)) => {
                let fh = self.file_handles.alloc(file, sid);
                reply.created(
                    &TTL,
                    &record_to_file_attr(&record),
                    Generation(0),
                    FileHandle(fh),
                    FopenFlags::empty(),
                );
            }
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", u64::from(parent), name);

        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.dispatcher.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", u64::from(parent), name);

        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.dispatcher.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let raw_flags = flags.0;
        debug!("open(ino={}, flags={})", u64::from(ino), raw_flags);

        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let sid = get_sid(req.pid());
        let holder = self.holder_for(sid);
        match self
            .dispatcher
            .open(&path, OpenIntent::from_flags(raw_flags), &holder)
        {
            Ok(file) => {
                let fh = self.file_handles.alloc(file, sid);
                reply.opened(FileHandle(fh), FopenFlags::empty());
            }
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let fh = u64::from(fh);
        debug!("read(ino={}, fh={}, offset={}, size={})", u64::from(ino), fh, offset, size);

        let path = match self.file_handles.get(fh) {
            Some(h) => h.file.path,
            None => match self.path_of(ino) {
                Ok(p) => p,
                Err(e) => {
                    reply.error(e);
                    return;
                }
            },
        };
        match self.dispatcher.read(&path, size, offset) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let fh = u64::from(fh);
        debug!("write(ino={}, fh={}, offset={}, size={})", u64::from(ino), fh, offset, data.len());

        let path = match self.file_handles.get(fh) {
            Some(h) => h.file.path,
            None => {
                reply.error(Errno::EBADF);
                return;
            }
        };
        match self.dispatcher.write(&path, data, offset) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn flush(&self, _req: &Request, ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        // Writes are committed before they are acknowledged.
        debug!("flush(ino={}, fh={})", u64::from(ino), u64::from(fh));
        reply.ok();
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fh = u64::from(fh);
        debug!("release(fh={})", fh);

        if let Some(handle) = self.file_handles.remove(fh) {
            self.dispatcher.release(&handle.file);
        }
        reply.ok();
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", u64::from(ino), offset);

        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let entries = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(to_errno(&e));
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let kind: FileType = kind_to_filetype(entry.kind);
            if reply.add(INodeNo(entry.ino), (i + 1) as u64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            u64::from(parent),
            name,
            u64::from(newparent),
            newname
        );
        // Paths are record identities; moving one would orphan its subtree.
        reply.error(raw_errno(libc::ENOTSUP));
    }

    fn symlink(
        &self,
        _req: &Request,
        _parent: INodeNo,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(raw_errno(libc::ENOTSUP));
    }

    fn link(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _newparent: INodeNo,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(raw_errno(libc::ENOTSUP));
    }
}
