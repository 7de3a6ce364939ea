//! Remote filesystem protocol client.
//!
//! [`RemoteFs`] is the seam between the operation handlers and whatever
//! serves the remote namespace. Implementations issue exactly one remote call
//! per method and report ok / not-ok; they never retry and never interpret a
//! failure. Retry is policy and lives with the caller.
//!
//! - `grpc`: the production client speaking `proto.FileSystem` over tonic.
//! - `local`: the same contract served from a directory on local disk.

pub mod grpc;
pub mod local;

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use crate::vpath::VirtualPath;

pub use grpc::GrpcRemote;
pub use local::LocalDirRemote;

/// Transport-level failure of a single remote call.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a Stat call. Only `mod_time` outlives the call, implicitly, as
/// the mtime of the local cache file written after a fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub is_directory: bool,
    /// The service reports "absent" through this flag. It does not separate a
    /// missing path from a missing parent.
    pub directory_missing: bool,
    pub size: u64,
    pub mod_time: SystemTime,
}

impl RemoteFileInfo {
    pub fn missing() -> Self {
        Self {
            is_directory: false,
            directory_missing: true,
            size: 0,
            mod_time: UNIX_EPOCH,
        }
    }
}

impl From<crate::proto::FileInfo> for RemoteFileInfo {
    fn from(info: crate::proto::FileInfo) -> Self {
        Self {
            is_directory: info.isdir,
            directory_missing: info.direxists,
            size: u64::try_from(info.size).unwrap_or(0),
            mod_time: unix_secs_to_time(info.modtime),
        }
    }
}

pub(crate) fn unix_secs_to_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))
            .unwrap_or(UNIX_EPOCH)
    }
}

#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn stat(&self, path: &VirtualPath) -> Result<RemoteFileInfo, RemoteError>;

    /// Whole-file fetch.
    async fn get(&self, path: &VirtualPath) -> Result<Vec<u8>, RemoteError>;

    /// Whole-file push, replacing any existing content.
    async fn put(&self, path: &VirtualPath, contents: Vec<u8>) -> Result<(), RemoteError>;

    async fn mkdir(&self, path: &VirtualPath) -> Result<(), RemoteError>;

    async fn rmdir(&self, path: &VirtualPath) -> Result<(), RemoteError>;

    async fn unlink(&self, path: &VirtualPath) -> Result<(), RemoteError>;

    async fn rename(&self, old: &VirtualPath, new: &VirtualPath) -> Result<(), RemoteError>;

    /// Entry names in the order the service returned them.
    async fn read_dir(&self, path: &VirtualPath) -> Result<Vec<String>, RemoteError>;
}

#[async_trait]
impl<T: RemoteFs + ?Sized> RemoteFs for Arc<T> {
    async fn stat(&self, path: &VirtualPath) -> Result<RemoteFileInfo, RemoteError> {
        (**self).stat(path).await
    }

    async fn get(&self, path: &VirtualPath) -> Result<Vec<u8>, RemoteError> {
        (**self).get(path).await
    }

    async fn put(&self, path: &VirtualPath, contents: Vec<u8>) -> Result<(), RemoteError> {
        (**self).put(path, contents).await
    }

    async fn mkdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        (**self).mkdir(path).await
    }

    async fn rmdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        (**self).rmdir(path).await
    }

    async fn unlink(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        (**self).unlink(path).await
    }

    async fn rename(&self, old: &VirtualPath, new: &VirtualPath) -> Result<(), RemoteError> {
        (**self).rename(old, new).await
    }

    async fn read_dir(&self, path: &VirtualPath) -> Result<Vec<String>, RemoteError> {
        (**self).read_dir(path).await
    }
}
