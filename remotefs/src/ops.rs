//! Operation handlers.
//!
//! [`CacheFs`] implements the virtual-filesystem operation contract on top
//! of a [`RemoteFs`], the local cache and atomic sessions. Handlers are path
//! based; the FUSE adapter in `crate::fuse` resolves inodes to paths before
//! calling in.
//!
//! Retry policy: Stat for metadata queries and the empty-content Put behind
//! create and truncate go through [`retry::with_backoff`]. Every other remote
//! call is attempted once and its failure is returned immediately.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cache::{AtomicSession, CachePathResolver, PathLocks, needs_refresh};
use crate::config::Config;
use crate::error::{FsError, Result};
use crate::remote::{RemoteFileInfo, RemoteFs};
use crate::retry::{self, RetryPolicy};
use crate::vpath::VirtualPath;

pub const DIR_PERM: u16 = 0o755;
pub const FILE_PERM: u16 = 0o644;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Attributes synthesised from a remote Stat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub size: u64,
    pub mtime: SystemTime,
}

impl Metadata {
    fn from_remote(info: &RemoteFileInfo) -> Self {
        if info.is_directory {
            Self {
                kind: NodeKind::Directory,
                perm: DIR_PERM,
                nlink: 2,
                size: 0,
                mtime: info.mod_time,
            }
        } else {
            Self {
                kind: NodeKind::File,
                perm: FILE_PERM,
                nlink: 1,
                size: info.size,
                mtime: info.mod_time,
            }
        }
    }
}

struct OpenFile {
    path: VirtualPath,
    /// Taken on release.
    session: Option<AtomicSession>,
}

pub struct CacheFs<R: RemoteFs> {
    remote: R,
    resolver: CachePathResolver,
    staging_dir: PathBuf,
    locks: PathLocks,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    handles: RwLock<HashMap<u64, Arc<Mutex<OpenFile>>>>,
    next_fh: AtomicU64,
}

impl<R: RemoteFs> CacheFs<R> {
    /// Create the cache and staging directories if needed and wrap `remote`.
    pub fn new(remote: R, config: &Config) -> io::Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;
        fs::create_dir_all(&config.staging_dir)?;
        Ok(Self {
            remote,
            resolver: CachePathResolver::new(&config.cache_dir),
            staging_dir: config.staging_dir.clone(),
            locks: PathLocks::new(),
            retry: config.retry.clone(),
            shutdown: CancellationToken::new(),
            handles: RwLock::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        })
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn resolver(&self) -> &CachePathResolver {
        &self.resolver
    }

    /// Cancel the root token: every pending and future retry loop fails with
    /// [`FsError::Cancelled`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn open_handles(&self) -> usize {
        self.handles.read().await.len()
    }

    async fn stat_retrying(&self, path: &VirtualPath) -> Result<RemoteFileInfo> {
        retry::with_backoff(&self.retry, &self.shutdown, "stat", || self.remote.stat(path)).await
    }

    async fn put_empty_retrying(&self, path: &VirtualPath) -> Result<()> {
        retry::with_backoff(&self.retry, &self.shutdown, "put", || {
            self.remote.put(path, Vec::new())
        })
        .await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get_metadata(&self, path: &VirtualPath) -> Result<Metadata> {
        let info = self.stat_retrying(path).await?;
        if info.directory_missing {
            return Err(FsError::NotFound);
        }
        Ok(Metadata::from_remote(&info))
    }

    /// Kind of `path` from a single Stat, for directory listings. Unreachable
    /// and absent children both report [`FsError::NotFound`].
    pub async fn node_kind(&self, path: &VirtualPath) -> Result<NodeKind> {
        match self.remote.stat(path).await {
            Ok(info) if !info.directory_missing => Ok(Metadata::from_remote(&info).kind),
            Ok(_) => Err(FsError::NotFound),
            Err(e) => {
                debug!("stat {path} failed: {e}");
                Err(FsError::NotFound)
            }
        }
    }

    /// Create `path` remotely with empty content.
    #[instrument(level = "debug", skip(self))]
    pub async fn create_empty(&self, path: &VirtualPath) -> Result<()> {
        self.put_empty_retrying(path).await?;
        self.evict_local(path, NodeKind::File).await;
        Ok(())
    }

    /// Only truncation to zero is supported; anything else is rejected
    /// without contacting the remote service.
    #[instrument(level = "debug", skip(self))]
    pub async fn truncate(&self, path: &VirtualPath, size: u64) -> Result<()> {
        if size != 0 {
            return Err(FsError::Unsupported);
        }
        self.create_empty(path).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn make_directory(&self, path: &VirtualPath) -> Result<()> {
        self.remote.mkdir(path).await.map_err(|e| {
            debug!("mkdir {path} failed: {e}");
            FsError::NotFound
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn remove(&self, path: &VirtualPath) -> Result<()> {
        self.remote.unlink(path).await.map_err(|e| {
            debug!("unlink {path} failed: {e}");
            FsError::NotFound
        })?;
        self.evict_local(path, NodeKind::File).await;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn remove_directory(&self, path: &VirtualPath) -> Result<()> {
        self.remote.rmdir(path).await.map_err(|e| {
            debug!("rmdir {path} failed: {e}");
            FsError::NotFound
        })?;
        self.evict_local(path, NodeKind::Directory).await;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn rename(&self, old: &VirtualPath, new: &VirtualPath) -> Result<()> {
        self.remote.rename(old, new).await.map_err(|e| {
            debug!("rename {old} -> {new} failed: {e}");
            FsError::NotFound
        })?;
        self.rename_local(old, new).await;
        Ok(())
    }

    /// `.` and `..` followed by the remote names in the order received.
    #[instrument(level = "debug", skip(self))]
    pub async fn list_directory(&self, path: &VirtualPath) -> Result<Vec<String>> {
        let names = self.remote.read_dir(path).await.map_err(|e| {
            debug!("readdir {path} failed: {e}");
            FsError::AccessDenied(io::Error::other(e))
        })?;
        let mut entries = Vec::with_capacity(names.len() + 2);
        entries.push(".".to_string());
        entries.push("..".to_string());
        entries.extend(names);
        Ok(entries)
    }

    /// Refresh the local copy of `path` if needed and open a session on it.
    /// Returns the new file handle.
    #[instrument(level = "debug", skip(self))]
    pub async fn open(&self, path: &VirtualPath, flags: u32) -> Result<u64> {
        let info = self.remote.stat(path).await.map_err(|e| {
            debug!("stat {path} failed: {e}");
            FsError::NotFound
        })?;
        let local = self.resolver.resolve(path);

        let session = {
            let _guard = self.locks.lock(&local).await;
            if info.is_directory {
                // the mirror keeps directories as directories; the handle
                // reads and writes a scratch file that is dropped on release
                fs::create_dir_all(&local)?;
                AtomicSession::detached(&self.staging_dir, flags)?
            } else if info.directory_missing {
                return Err(FsError::NotFound);
            } else if needs_refresh(&info, &local)? {
                let contents = self.remote.get(path).await.map_err(|e| {
                    debug!("get {path} failed: {e}");
                    FsError::NotFound
                })?;
                self.store_fetched(&local, &contents, info.mod_time)?;
                AtomicSession::open(&local, &self.staging_dir, flags)?
            } else {
                debug!("cache hit for {path}");
                AtomicSession::open(&local, &self.staging_dir, flags)?
            }
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let entry = OpenFile {
            path: path.clone(),
            session: Some(session),
        };
        self.handles
            .write()
            .await
            .insert(fh, Arc::new(Mutex::new(entry)));
        Ok(fh)
    }

    /// Replace the committed file with fetched content in one rename, stamped
    /// with the remote modification time.
    fn store_fetched(&self, local: &Path, contents: &[u8], mod_time: SystemTime) -> Result<()> {
        CachePathResolver::ensure_parents(local)?;
        let tmp = self.staging_dir.join(format!("{}.fetch", Uuid::new_v4()));
        let res = (|| -> io::Result<()> {
            fs::write(&tmp, contents)?;
            let f = OpenOptions::new().write(true).open(&tmp)?;
            f.set_modified(mod_time)?;
            f.sync_all()?;
            drop(f);
            fs::rename(&tmp, local)
        })();
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    async fn handle(&self, fh: u64) -> Result<Arc<Mutex<OpenFile>>> {
        self.handles
            .read()
            .await
            .get(&fh)
            .cloned()
            .ok_or(FsError::BadHandle(fh))
    }

    pub async fn read(&self, fh: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let handle = self.handle(fh).await?;
        let guard = handle.lock().await;
        let session = guard.session.as_ref().ok_or(FsError::BadHandle(fh))?;
        session.read(offset, len)
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handle(fh).await?;
        let mut guard = handle.lock().await;
        let session = guard.session.as_mut().ok_or(FsError::BadHandle(fh))?;
        session.write(offset, data)
    }

    /// Push the staged content to the remote service if the handle was
    /// written. The dirty flag stays set, so release still commits.
    #[instrument(level = "debug", skip(self))]
    pub async fn flush(&self, fh: u64) -> Result<()> {
        let handle = self.handle(fh).await?;
        let (path, contents) = {
            let guard = handle.lock().await;
            let session = guard.session.as_ref().ok_or(FsError::BadHandle(fh))?;
            if !session.is_dirty() {
                return Ok(());
            }
            (guard.path.clone(), session.snapshot()?)
        };
        self.remote.put(&path, contents).await.map_err(|e| {
            warn!("push of {path} failed: {e}");
            FsError::AccessDenied(io::Error::other(e))
        })
    }

    /// Commit the handle's staged content into the cache and drop the handle.
    #[instrument(level = "debug", skip(self))]
    pub async fn release(&self, fh: u64) -> Result<()> {
        let handle = self
            .handles
            .write()
            .await
            .remove(&fh)
            .ok_or(FsError::BadHandle(fh))?;
        let session = handle
            .lock()
            .await
            .session
            .take()
            .ok_or(FsError::BadHandle(fh))?;
        let _guard = match session.committed_path() {
            Some(committed) => Some(self.locks.lock(committed).await),
            None => None,
        };
        session.commit()
    }

    async fn evict_local(&self, path: &VirtualPath, kind: NodeKind) {
        let local = self.resolver.resolve(path);
        let _guard = self.locks.lock(&local).await;
        remove_local(&local, kind);
    }

    async fn rename_local(&self, old: &VirtualPath, new: &VirtualPath) {
        let from = self.resolver.resolve(old);
        let to = self.resolver.resolve(new);
        if from == to {
            return;
        }
        // fixed order so two crossing renames cannot deadlock
        let (first, second) = if from < to { (&from, &to) } else { (&to, &from) };
        let _g1 = self.locks.lock(first).await;
        let _g2 = self.locks.lock(second).await;

        let kind = if to.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        remove_local(&to, kind);
        if fs::symlink_metadata(&from).is_err() {
            return;
        }
        let moved = CachePathResolver::ensure_parents(&to).and_then(|_| fs::rename(&from, &to));
        if let Err(e) = moved {
            warn!(
                "could not move cache entry {} to {}: {e}",
                from.display(),
                to.display()
            );
            let kind = if from.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            };
            remove_local(&from, kind);
        }
    }
}

fn remove_local(local: &Path, kind: NodeKind) {
    let res = match kind {
        NodeKind::Directory => fs::remove_dir_all(local),
        NodeKind::File => fs::remove_file(local),
    };
    match res {
        Ok(()) => debug!("evicted {}", local.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not evict {}: {e}", local.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::LocalDirRemote;

    struct Fixture {
        _tmp: tempfile::TempDir,
        remote_root: PathBuf,
        fs: CacheFs<LocalDirRemote>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let remote_root = tmp.path().join("remote");
        fs::create_dir_all(&remote_root).unwrap();
        let config = Config {
            cache_dir: tmp.path().join("cache"),
            staging_dir: tmp.path().join("tmp"),
            ..Config::default()
        };
        let fs = CacheFs::new(LocalDirRemote::new(&remote_root), &config).unwrap();
        Fixture {
            _tmp: tmp,
            remote_root,
            fs,
        }
    }

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn metadata_for_files_and_directories() {
        let f = fixture();
        fs::create_dir(f.remote_root.join("d")).unwrap();
        fs::write(f.remote_root.join("d/file"), b"12345").unwrap();

        let dir = f.fs.get_metadata(&vp("/d")).await.unwrap();
        assert_eq!(dir.kind, NodeKind::Directory);
        assert_eq!(dir.perm, DIR_PERM);

        let file = f.fs.get_metadata(&vp("/d/file")).await.unwrap();
        assert_eq!(file.kind, NodeKind::File);
        assert_eq!(file.perm, FILE_PERM);
        assert_eq!(file.size, 5);

        assert!(matches!(
            f.fs.get_metadata(&vp("/d/missing")).await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn release_commits_and_drops_handle() {
        let f = fixture();
        fs::write(f.remote_root.join("w"), b"").unwrap();
        let fh = f.fs.open(&vp("/w"), libc::O_RDWR as u32).await.unwrap();
        f.fs.write(fh, 0, b"data").await.unwrap();
        assert_eq!(f.fs.open_handles().await, 1);

        f.fs.release(fh).await.unwrap();
        assert_eq!(f.fs.open_handles().await, 0);
        let local = f.fs.resolver().resolve(&vp("/w"));
        assert_eq!(fs::read(local).unwrap(), b"data");
        assert!(matches!(f.fs.read(fh, 0, 1).await, Err(FsError::BadHandle(_))));
        assert!(matches!(f.fs.release(fh).await, Err(FsError::BadHandle(_))));
    }

    #[tokio::test]
    async fn fetched_copy_carries_remote_mtime() {
        let f = fixture();
        fs::write(f.remote_root.join("m"), b"remote").unwrap();
        let meta = f.fs.get_metadata(&vp("/m")).await.unwrap();

        let fh = f.fs.open(&vp("/m"), libc::O_RDONLY as u32).await.unwrap();
        f.fs.release(fh).await.unwrap();

        let local = f.fs.resolver().resolve(&vp("/m"));
        let local_mtime = fs::metadata(&local).unwrap().modified().unwrap();
        assert_eq!(local_mtime, meta.mtime);
    }

    #[tokio::test]
    async fn rename_moves_cached_entry() {
        let f = fixture();
        fs::write(f.remote_root.join("a"), b"A").unwrap();
        let fh = f.fs.open(&vp("/a"), libc::O_RDONLY as u32).await.unwrap();
        f.fs.release(fh).await.unwrap();

        f.fs.rename(&vp("/a"), &vp("/b")).await.unwrap();
        let cache = f.fs.resolver();
        assert!(!cache.resolve(&vp("/a")).exists());
        assert_eq!(fs::read(cache.resolve(&vp("/b"))).unwrap(), b"A");
    }

    #[tokio::test]
    async fn structural_failures_report_not_found() {
        let f = fixture();
        assert!(matches!(
            f.fs.remove(&vp("/nope")).await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            f.fs.remove_directory(&vp("/nope")).await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            f.fs.make_directory(&vp("/x/y")).await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            f.fs.rename(&vp("/nope"), &vp("/other")).await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            f.fs.list_directory(&vp("/nope")).await,
            Err(FsError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn directory_open_keeps_mirror_usable() {
        let f = fixture();
        fs::create_dir(f.remote_root.join("d")).unwrap();
        fs::write(f.remote_root.join("d/x"), b"x").unwrap();
        fs::create_dir(f.remote_root.join("e")).unwrap();
        fs::write(f.remote_root.join("e/y"), b"y").unwrap();
        let ro = libc::O_RDONLY as u32;

        // child cached first, then its directory
        let fh = f.fs.open(&vp("/d/x"), ro).await.unwrap();
        f.fs.release(fh).await.unwrap();
        let fh = f.fs.open(&vp("/d"), ro).await.unwrap();
        assert!(f.fs.read(fh, 0, 16).await.unwrap().is_empty());
        f.fs.release(fh).await.unwrap();

        // directory first, then its child
        let fh = f.fs.open(&vp("/e"), ro).await.unwrap();
        f.fs.release(fh).await.unwrap();
        let fh = f.fs.open(&vp("/e/y"), ro).await.unwrap();
        assert_eq!(f.fs.read(fh, 0, 16).await.unwrap(), b"y");
        f.fs.release(fh).await.unwrap();

        let fh = f.fs.open(&VirtualPath::root(), ro).await.unwrap();
        f.fs.release(fh).await.unwrap();

        let cache = f.fs.resolver();
        assert!(cache.resolve(&vp("/d")).is_dir());
        assert!(cache.resolve(&vp("/e")).is_dir());
        assert_eq!(fs::read(cache.resolve(&vp("/d/x"))).unwrap(), b"x");
        assert_eq!(fs::read_dir(f._tmp.path().join("tmp")).unwrap().count(), 0);
    }
}
