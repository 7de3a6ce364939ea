//! Error taxonomy shared by the operation handlers and the FUSE adapter.
//!
//! Every handler failure collapses into one [`FsError`] and from there into a
//! single errno handed back to the kernel. Diagnostic detail only travels
//! through the log.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// The remote path (or its parent) is absent, or a single-attempt remote
    /// call could not reach the service. The two are indistinguishable here.
    #[error("not found")]
    NotFound,

    /// Local cache I/O failed, or a non-retried remote call failed where the
    /// bridge expects access-denied.
    #[error("access denied: {0}")]
    AccessDenied(#[source] io::Error),

    /// The staged file returned fewer bytes than its reported size.
    #[error("short read on staging file: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    /// Truncation to a non-zero size.
    #[error("operation not supported")]
    Unsupported,

    /// A retried call used up its attempt budget.
    #[error("remote service unavailable: {op} failed after {attempts} attempts")]
    Unavailable { op: &'static str, attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("invalid virtual path: {0:?}")]
    InvalidPath(String),
}

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied(_) | FsError::ShortRead { .. } => libc::EACCES,
            FsError::Unsupported => libc::EOPNOTSUPP,
            FsError::Unavailable { .. } => libc::ETIMEDOUT,
            FsError::Cancelled => libc::EINTR,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::InvalidPath(_) => libc::EINVAL,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::AccessDenied(e)
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(e: FsError) -> Self {
        e.errno().into()
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
