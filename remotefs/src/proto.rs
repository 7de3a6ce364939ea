//! Wire types and unary client for the `proto.FileSystem` gRPC service.
//!
//! The service is small and stable, so messages are declared directly with
//! prost derives instead of being generated from a `.proto` file at build
//! time. Field tags match the service definition:
//!
//! ```text
//! service FileSystem {
//!   rpc Stat(Path) returns (FileInfo);
//!   rpc Get(Path) returns (Contents);
//!   rpc Put(PutParameters) returns (Success);
//!   rpc MkDir(Path) returns (Success);
//!   rpc RmDir(Path) returns (Success);
//!   rpc Unlink(Path) returns (Success);
//!   rpc Rename(RenameParameters) returns (Success);
//!   rpc ReadDir(Path) returns (DirListing);
//! }
//! ```

use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Path {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub size: i64,
    /// Unix seconds.
    #[prost(int64, tag = "3")]
    pub modtime: i64,
    #[prost(bool, tag = "4")]
    pub isdir: bool,
    /// Set when the path itself is absent (its parent may or may not be).
    #[prost(bool, tag = "5")]
    pub direxists: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Contents {
    #[prost(bytes = "vec", tag = "1")]
    pub contents: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PutParameters {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(bytes = "vec", tag = "2")]
    pub contents: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RenameParameters {
    #[prost(string, tag = "1")]
    pub old: String,
    #[prost(string, tag = "2")]
    pub new: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Success {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirListing {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
}

/// Thin client over a tonic channel. Cloning is cheap and every call takes
/// `&mut self`, so callers clone per request.
#[derive(Clone, Debug)]
pub struct FileSystemClient {
    inner: tonic::client::Grpc<Channel>,
}

impl FileSystemClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Build a client whose channel connects on first use.
    pub fn connect_lazy(uri: &str) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(uri.to_string())?.connect_lazy();
        Ok(Self::new(channel))
    }

    async fn unary<Req, Resp>(
        &mut self,
        request: Req,
        path: &'static str,
    ) -> Result<Resp, tonic::Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service was not ready: {e}")))?;
        let codec = ProstCodec::<Req, Resp>::default();
        let path = PathAndQuery::from_static(path);
        self.inner
            .unary(tonic::Request::new(request), path, codec)
            .await
            .map(tonic::Response::into_inner)
    }

    pub async fn stat(&mut self, req: Path) -> Result<FileInfo, tonic::Status> {
        self.unary(req, "/proto.FileSystem/Stat").await
    }

    pub async fn get(&mut self, req: Path) -> Result<Contents, tonic::Status> {
        self.unary(req, "/proto.FileSystem/Get").await
    }

    pub async fn put(&mut self, req: PutParameters) -> Result<Success, tonic::Status> {
        self.unary(req, "/proto.FileSystem/Put").await
    }

    pub async fn mkdir(&mut self, req: Path) -> Result<Success, tonic::Status> {
        self.unary(req, "/proto.FileSystem/MkDir").await
    }

    pub async fn rmdir(&mut self, req: Path) -> Result<Success, tonic::Status> {
        self.unary(req, "/proto.FileSystem/RmDir").await
    }

    pub async fn unlink(&mut self, req: Path) -> Result<Success, tonic::Status> {
        self.unary(req, "/proto.FileSystem/Unlink").await
    }

    pub async fn rename(&mut self, req: RenameParameters) -> Result<Success, tonic::Status> {
        self.unary(req, "/proto.FileSystem/Rename").await
    }

    pub async fn read_dir(&mut self, req: Path) -> Result<DirListing, tonic::Status> {
        self.unary(req, "/proto.FileSystem/ReadDir").await
    }
}

/// Turn a configured server address into a channel URI, appending
/// `default_port` when the address has none.
pub fn endpoint_uri(server: &str, default_port: u16) -> String {
    if server.contains("://") {
        return server.to_string();
    }
    let has_port = if let Some(rest) = server.strip_prefix('[') {
        // [v6]:port
        rest.split_once("]:")
            .is_some_and(|(_, p)| p.parse::<u16>().is_ok())
    } else {
        server.matches(':').count() == 1
            && server
                .rsplit_once(':')
                .is_some_and(|(_, p)| p.parse::<u16>().is_ok())
    };
    if has_port {
        format!("http://{server}")
    } else if server.contains(':') && !server.starts_with('[') {
        format!("http://[{server}]:{default_port}")
    } else {
        format!("http://{server}:{default_port}")
    }
}
