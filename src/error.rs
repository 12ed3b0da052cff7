use std::io;
use thiserror::Error;

/// Main error type for object-store and filesystem operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Content verification failed for {name}: expected etag {expected}, computed {actual}")]
    ContentVerification {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{method} {url} failed{}: {message}", status_suffix(.status))]
    Transport {
        method: String,
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Bad descriptor: {0}")]
    BadDescriptor(String),

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            StoreError::NotFound(_) => libc::ENOENT,
            StoreError::Conflict(_) => libc::ENOTEMPTY,
            StoreError::AlreadyExists(_) => libc::EEXIST,
            StoreError::ContentVerification { .. } => libc::EIO,
            StoreError::Configuration(_) => libc::EINVAL,
            StoreError::Transport { .. } => libc::EIO,
            StoreError::Unauthorized(_) => libc::EACCES,
            StoreError::InvalidArgument(_) => libc::EINVAL,
            StoreError::BadDescriptor(_) => libc::EBADF,
            StoreError::ReadOnly => libc::EROFS,
            StoreError::FileTooLarge(_) => libc::EFBIG,
            StoreError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True when the error means the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

/// Result type alias for objstore-fs operations
pub type Result<T> = std::result::Result<T, StoreError>;
