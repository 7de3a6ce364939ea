//! FUSE client for a remote gRPC filesystem service.
//!
//! Reads are served from a local cache that is refreshed when the remote copy
//! is newer. Writes go to a private staging copy per open handle, are pushed
//! to the remote service on flush and become the cached copy on release.

pub mod cache;
pub mod config;
pub mod error;
pub mod fuse;
pub mod ops;
pub mod proto;
pub mod remote;
pub mod retry;
pub mod vpath;

pub use error::{FsError, Result};
pub use ops::CacheFs;
pub use vpath::VirtualPath;
