//! Conversions between store records and FUSE types.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use fuser::{FileAttr, FileType, INodeNo};

use crate::store::{FileKind, FileRecord};

const BLOCK_SIZE: u32 = 512;

/// Build the attributes the kernel sees for a record.
pub fn record_to_file_attr(record: &FileRecord) -> FileAttr {
    FileAttr {
        ino: INodeNo(record.ino),
        size: record.size,
        blocks: record.size.div_ceil(BLOCK_SIZE as u64),
        atime: system_time(record.accessed_at),
        mtime: system_time(record.modified_at),
        ctime: system_time(record.modified_at),
        crtime: system_time(record.created_at),
        kind: kind_to_filetype(record.kind()),
        perm: record.perm() as u16,
        nlink: record.link_count,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub fn kind_to_filetype(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
    }
}

pub fn system_time(t: DateTime<Utc>) -> SystemTime {
    let micros = t.timestamp_micros();
    if micros >= 0 {
        UNIX_EPOCH + Duration::from_micros(micros as u64)
    } else {
        UNIX_EPOCH
    }
}

pub fn from_system_time(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}
