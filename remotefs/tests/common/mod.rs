#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use remotefs::CacheFs;
use remotefs::VirtualPath;
use remotefs::config::Config;
use remotefs::remote::{LocalDirRemote, RemoteError, RemoteFileInfo, RemoteFs};
use remotefs::retry::RetryPolicy;
use tempfile::TempDir;

pub fn vp(s: &str) -> VirtualPath {
    VirtualPath::parse(s).unwrap()
}

pub fn config(base: &Path) -> Config {
    Config {
        cache_dir: base.join("cache"),
        staging_dir: base.join("tmp"),
        retry: RetryPolicy {
            max_attempts: 4,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..Config::default()
    }
}

pub struct Harness<R: RemoteFs> {
    pub tmp: TempDir,
    pub remote_root: PathBuf,
    pub fs: Arc<CacheFs<R>>,
}

impl<R: RemoteFs> Harness<R> {
    pub fn cache_path(&self, path: &str) -> PathBuf {
        self.fs.resolver().resolve(&vp(path))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.tmp.path().join("tmp")
    }

    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.staging_dir()).unwrap().count()
    }

    /// Whole content through a fresh read-only handle.
    pub async fn read_all(&self, path: &str) -> Vec<u8> {
        let fh = self.fs.open(&vp(path), libc::O_RDONLY as u32).await.unwrap();
        let data = self.fs.read(fh, 0, 1 << 20).await.unwrap();
        self.fs.release(fh).await.unwrap();
        data
    }
}

pub fn local_harness() -> Harness<LocalDirRemote> {
    let tmp = tempfile::tempdir().unwrap();
    let remote_root = tmp.path().join("remote");
    std::fs::create_dir_all(&remote_root).unwrap();
    let fs = CacheFs::new(LocalDirRemote::new(&remote_root), &config(tmp.path())).unwrap();
    Harness {
        tmp,
        remote_root,
        fs: Arc::new(fs),
    }
}

pub fn faulty_harness() -> (Harness<Arc<FaultyRemote>>, Arc<FaultyRemote>) {
    let tmp = tempfile::tempdir().unwrap();
    let remote_root = tmp.path().join("remote");
    std::fs::create_dir_all(&remote_root).unwrap();
    let remote = Arc::new(FaultyRemote::new(LocalDirRemote::new(&remote_root)));
    let fs = CacheFs::new(remote.clone(), &config(tmp.path())).unwrap();
    (
        Harness {
            tmp,
            remote_root,
            fs: Arc::new(fs),
        },
        remote,
    )
}

/// Wraps a [`LocalDirRemote`], recording every call and failing a configured
/// number of Stat/Get/Put calls with `unavailable`.
pub struct FaultyRemote {
    inner: LocalDirRemote,
    stat_failures: AtomicU32,
    get_failures: AtomicU32,
    put_failures: AtomicU32,
    listing: Mutex<Option<Vec<String>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FaultyRemote {
    pub fn new(inner: LocalDirRemote) -> Self {
        Self {
            inner,
            stat_failures: AtomicU32::new(0),
            get_failures: AtomicU32::new(0),
            put_failures: AtomicU32::new(0),
            listing: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_stats(&self, n: u32) {
        self.stat_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, n: u32) {
        self.get_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    /// Answer every ReadDir with `names`, as given.
    pub fn script_listing(&self, names: &[&str]) {
        *self.listing.lock().unwrap() = Some(names.iter().map(|s| s.to_string()).collect());
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| **c == op).count()
    }

    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap().push(op);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn unavailable() -> RemoteError {
    tonic::Status::unavailable("injected").into()
}

#[async_trait]
impl RemoteFs for FaultyRemote {
    async fn stat(&self, path: &VirtualPath) -> Result<RemoteFileInfo, RemoteError> {
        self.record("stat");
        if Self::take_failure(&self.stat_failures) {
            return Err(unavailable());
        }
        self.inner.stat(path).await
    }

    async fn get(&self, path: &VirtualPath) -> Result<Vec<u8>, RemoteError> {
        self.record("get");
        if Self::take_failure(&self.get_failures) {
            return Err(unavailable());
        }
        self.inner.get(path).await
    }

    async fn put(&self, path: &VirtualPath, contents: Vec<u8>) -> Result<(), RemoteError> {
        self.record("put");
        if Self::take_failure(&self.put_failures) {
            return Err(unavailable());
        }
        self.inner.put(path, contents).await
    }

    async fn mkdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        self.record("mkdir");
        self.inner.mkdir(path).await
    }

    async fn rmdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        self.record("rmdir");
        self.inner.rmdir(path).await
    }

    async fn unlink(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        self.record("unlink");
        self.inner.unlink(path).await
    }

    async fn rename(&self, old: &VirtualPath, new: &VirtualPath) -> Result<(), RemoteError> {
        self.record("rename");
        self.inner.rename(old, new).await
    }

    async fn read_dir(&self, path: &VirtualPath) -> Result<Vec<String>, RemoteError> {
        self.record("read_dir");
        let scripted = self.listing.lock().unwrap().clone();
        match scripted {
            Some(names) => Ok(names),
            None => self.inner.read_dir(path).await,
        }
    }
}
