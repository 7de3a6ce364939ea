//! `RemoteFs` over the `proto.FileSystem` gRPC service.

use async_trait::async_trait;
use tracing::debug;

use super::{RemoteError, RemoteFileInfo, RemoteFs};
use crate::proto::{self, FileSystemClient};
use crate::vpath::VirtualPath;

#[derive(Clone, Debug)]
pub struct GrpcRemote {
    client: FileSystemClient,
}

impl GrpcRemote {
    pub fn new(client: FileSystemClient) -> Self {
        Self { client }
    }

    /// Connect lazily to `server`, appending `default_port` when the address
    /// has none. No network traffic happens until the first call.
    pub fn connect_lazy(server: &str, default_port: u16) -> Result<Self, RemoteError> {
        let uri = proto::endpoint_uri(server, default_port);
        debug!("remote endpoint {uri}");
        Ok(Self::new(FileSystemClient::connect_lazy(&uri)?))
    }

    fn path(p: &VirtualPath) -> proto::Path {
        proto::Path {
            path: p.as_str().to_string(),
        }
    }
}

#[async_trait]
impl RemoteFs for GrpcRemote {
    async fn stat(&self, path: &VirtualPath) -> Result<RemoteFileInfo, RemoteError> {
        let info = self.client.clone().stat(Self::path(path)).await?;
        Ok(info.into())
    }

    async fn get(&self, path: &VirtualPath) -> Result<Vec<u8>, RemoteError> {
        let contents = self.client.clone().get(Self::path(path)).await?;
        Ok(contents.contents)
    }

    async fn put(&self, path: &VirtualPath, contents: Vec<u8>) -> Result<(), RemoteError> {
        let params = proto::PutParameters {
            path: path.as_str().to_string(),
            contents,
        };
        self.client.clone().put(params).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        self.client.clone().mkdir(Self::path(path)).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        self.client.clone().rmdir(Self::path(path)).await?;
        Ok(())
    }

    async fn unlink(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        self.client.clone().unlink(Self::path(path)).await?;
        Ok(())
    }

    async fn rename(&self, old: &VirtualPath, new: &VirtualPath) -> Result<(), RemoteError> {
        let params = proto::RenameParameters {
            old: old.as_str().to_string(),
            new: new.as_str().to_string(),
        };
        self.client.clone().rename(params).await?;
        Ok(())
    }

    async fn read_dir(&self, path: &VirtualPath) -> Result<Vec<String>, RemoteError> {
        let listing = self.client.clone().read_dir(Self::path(path)).await?;
        Ok(listing.names)
    }
}
