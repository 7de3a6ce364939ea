//! Local cache of remote file contents.
//!
//! The cache root mirrors the remote namespace one-to-one. A sibling staging
//! directory holds per-handle private copies; they only become visible under
//! the committed name through an atomic rename.
//!
//! - `path`: virtual path -> local path, parent creation.
//! - `staleness`: whether a local copy must be re-fetched.
//! - `session`: staged, atomically committed file handles.
//! - `lock`: per-path advisory locks serialising open and commit.

pub mod lock;
pub mod path;
pub mod session;
pub mod staleness;

pub use lock::PathLocks;
pub use path::CachePathResolver;
pub use session::AtomicSession;
pub use staleness::needs_refresh;
