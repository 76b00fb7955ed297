use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("File exists: {0}")]
    AlreadyExists(String),

    #[error("Parent directory does not exist: {0}")]
    ParentNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Write access denied on {path}: locked by {holder}")]
    AccessDenied { path: String, holder: String },

    #[error("Lock on {path} already held by {holder}")]
    AlreadyLocked { path: String, holder: String },

    #[error("No lock held on {0}")]
    NotLocked(String),

    #[error("Lock on {path} is held by {holder}, not {caller}")]
    NotOwner {
        path: String,
        holder: String,
        caller: String,
    },

    #[error("File too large: {0}")]
    TooLarge(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Store error: {0}")]
    Io(#[from] rusqlite::Error),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FsError {
    /// POSIX errno reported to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(_) | FsError::ParentNotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::Busy(_) => libc::EBUSY,
            FsError::AccessDenied { .. } | FsError::AlreadyLocked { .. } => libc::EACCES,
            FsError::NotLocked(_) => libc::ENOLCK,
            FsError::NotOwner { .. } => libc::EPERM,
            FsError::TooLarge(_) => libc::EFBIG,
            FsError::InvalidPath(_) => libc::EINVAL,
            FsError::Io(_) | FsError::Mount(_) | FsError::Config(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
