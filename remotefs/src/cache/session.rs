//! Atomic sessions: one per open file handle.
//!
//! `Opened -> (Read|Written)* -> Flushed? -> Released`
//!
//! Open copies the committed file into a private staging file and all further
//! I/O on the handle goes to that copy. Commit fsyncs the copy and renames it
//! over the committed path, so a reader of the committed path sees either the
//! old or the new content in full. If commit fails the staging file stays on
//! disk.
//!
//! A detached session (directories) starts from an empty staging file and is
//! discarded on commit; it never touches the cache mirror.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use super::path::CachePathResolver;
use crate::error::{FsError, Result};

#[derive(Debug)]
pub struct AtomicSession {
    file: File,
    /// `None` for detached sessions.
    committed: Option<PathBuf>,
    staging: PathBuf,
    dirty: bool,
}

/// Access mode requested by the caller's open flags.
fn open_options(flags: u32) -> (OpenOptions, bool) {
    let flags = flags as libc::c_int;
    let mut opts = OpenOptions::new();
    let writable = match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
            true
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
            true
        }
        _ => {
            opts.read(true);
            false
        }
    };
    let truncate = writable && flags & libc::O_TRUNC != 0;
    opts.truncate(truncate);
    (opts, truncate)
}

impl AtomicSession {
    /// Copy `committed` into a fresh staging file under `staging_dir` and open
    /// that copy with the access mode from `flags`.
    ///
    /// On failure nothing is left behind in `staging_dir`.
    pub fn open(committed: &Path, staging_dir: &Path, flags: u32) -> Result<Self> {
        Self::start(Some(committed), staging_dir, flags)
    }

    /// Session over an empty staging file with no committed counterpart.
    /// Commit discards it.
    pub fn detached(staging_dir: &Path, flags: u32) -> Result<Self> {
        Self::start(None, staging_dir, flags)
    }

    fn start(committed: Option<&Path>, staging_dir: &Path, flags: u32) -> Result<Self> {
        let staging = staging_dir.join(format!("{}.stage", Uuid::new_v4()));
        match Self::open_staged(committed, &staging, flags) {
            Ok((file, truncated)) => {
                if let Some(committed) = committed {
                    debug!("staged {} as {}", committed.display(), staging.display());
                }
                Ok(Self {
                    file,
                    committed: committed.map(Path::to_path_buf),
                    staging,
                    dirty: truncated,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&staging);
                Err(e.into())
            }
        }
    }

    fn open_staged(
        committed: Option<&Path>,
        staging: &Path,
        flags: u32,
    ) -> io::Result<(File, bool)> {
        let mut src = committed.map(File::open).transpose()?;
        let mut dst = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(staging)?;
        if let Some(src) = src.as_mut() {
            io::copy(src, &mut dst)?;
        }
        drop(dst);

        let (opts, truncated) = open_options(flags);
        Ok((opts.open(staging)?, truncated))
    }

    pub fn committed_path(&self) -> Option<&Path> {
        self.committed.as_deref()
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Positioned read from the staging copy. Returns fewer than `len` bytes
    /// only at end of file.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Positioned write to the staging copy. Marks the session dirty even if
    /// the bytes are unchanged.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.dirty = true;
        self.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Full staged content, for pushing back to the remote service.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.file.sync_all()?;
        let reader = File::open(&self.staging)?;
        let expected = reader.metadata()?.len();
        let mut contents = Vec::with_capacity(expected as usize);
        reader.take(expected).read_to_end(&mut contents)?;
        let actual = contents.len() as u64;
        if actual < expected {
            return Err(FsError::ShortRead { expected, actual });
        }
        Ok(contents)
    }

    /// Make the staged content the committed cache file.
    pub fn commit(self) -> Result<()> {
        let Self {
            file,
            committed,
            staging,
            ..
        } = self;
        let Some(committed) = committed else {
            drop(file);
            if let Err(e) = fs::remove_file(&staging) {
                warn!("could not discard {}: {e}", staging.display());
            }
            return Ok(());
        };
        let res = (|| -> io::Result<()> {
            file.sync_all()?;
            drop(file);
            CachePathResolver::ensure_parents(&committed)?;
            fs::rename(&staging, &committed)
        })();
        if let Err(e) = res {
            warn!(
                "commit of {} failed, staging file left at {}: {e}",
                committed.display(),
                staging.display()
            );
            return Err(e.into());
        }
        debug!("committed {}", committed.display());
        Ok(())
    }
}
