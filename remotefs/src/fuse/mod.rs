//! FUSE adapter.
//!
//! [`FuseFs`] implements the rfuse3 raw `Filesystem` trait on top of
//! [`CacheFs`]. It owns the inode table, turns `(parent, name)` pairs into
//! virtual paths and shapes handler results into FUSE replies. Every handler
//! error leaves here as a single errno.
//!
//! - `inode`: inode number <-> virtual path table.
//! - `mount`: mount helpers over rfuse3 sessions.
pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{FileType, SetAttr, Timestamp};
use tracing::{debug, warn};

use crate::error::FsError;
use crate::ops::{CacheFs, Metadata, NodeKind};
use crate::remote::RemoteFs;
use crate::vpath::VirtualPath;

pub use inode::{InodeTable, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: NonZeroU32 = NonZeroU32::new(1024 * 1024).unwrap();

pub struct FuseFs<R: RemoteFs> {
    fs: Arc<CacheFs<R>>,
    inodes: InodeTable,
}

impl<R: RemoteFs> FuseFs<R> {
    pub fn new(fs: Arc<CacheFs<R>>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    /// Optionally push `fh`, then release it. The handle is released even
    /// when the push fails; the first error is returned.
    pub async fn release_handle(&self, fh: u64, flush: bool) -> crate::Result<()> {
        let flushed = if flush {
            self.fs.flush(fh).await
        } else {
            Ok(())
        };
        let released = self.fs.release(fh).await;
        flushed.and(released)
    }

    async fn path_of(&self, ino: u64) -> FuseResult<VirtualPath> {
        self.inodes
            .path_of(ino)
            .await
            .ok_or_else(|| libc::ENOENT.into())
    }

    async fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<VirtualPath> {
        let Some(name) = name.to_str() else {
            return Err(libc::EINVAL.into());
        };
        let parent = self.path_of(parent).await?;
        Ok(parent.join(name)?)
    }

    /// Stat `path` and hand the kernel a counted reference to its inode.
    async fn entry(&self, req: &Request, path: &VirtualPath) -> FuseResult<ReplyEntry> {
        let meta = self.fs.get_metadata(path).await?;
        let ino = self.inodes.intern(path).await;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(ino, &meta, req),
            generation: 0,
        })
    }

    /// Names after `offset`, paired with their paths. Names the remote
    /// service returns that are not a single path component are dropped.
    async fn listing(
        &self,
        ino: u64,
        offset: usize,
    ) -> FuseResult<(VirtualPath, Vec<(usize, String, VirtualPath)>)> {
        let dir = self.path_of(ino).await?;
        let names = self.fs.list_directory(&dir).await?;
        let mut out = Vec::with_capacity(names.len().saturating_sub(offset));
        for (i, name) in names.into_iter().enumerate().skip(offset) {
            let path = match name.as_str() {
                "." => dir.clone(),
                ".." => dir.parent().unwrap_or_else(VirtualPath::root),
                _ => match dir.join(&name) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("skipping entry in {dir}: {e}");
                        continue;
                    }
                },
            };
            out.push((i, name, path));
        }
        Ok((dir, out))
    }

    /// Listing with attributes and inodes for readdirplus. Absent children
    /// are skipped; any other failure aborts before a lookup count is taken.
    async fn resolved_listing(
        &self,
        ino: u64,
        offset: usize,
    ) -> FuseResult<Vec<(usize, String, u64, Metadata)>> {
        let (_, listing) = self.listing(ino, offset).await?;
        let mut resolved = Vec::with_capacity(listing.len());
        for (i, name, path) in listing {
            match self.fs.get_metadata(&path).await {
                Ok(meta) => resolved.push((i, name, path, meta)),
                Err(FsError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut out = Vec::with_capacity(resolved.len());
        for (i, name, path, meta) in resolved {
            // "." and ".." do not count as lookups
            let child_ino = if name == "." || name == ".." {
                self.inodes.ino_for(&path).await
            } else {
                self.inodes.intern(&path).await
            };
            out.push((i, name, child_ino, meta));
        }
        Ok(out)
    }
}

impl<R: RemoteFs + 'static> Filesystem for FuseFs<R> {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {
        self.fs.shutdown();
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name).await?;
        self.entry(&req, &path).await
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget(inode, nlookup).await;
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes.forget(inode, nlookup).await;
        }
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino).await?;
        let meta = self.fs.get_metadata(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &meta, &req),
        })
    }

    // ownership, mode and times are fixed; only size is honoured
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino).await?;
        if let Some(size) = set_attr.size {
            self.fs.truncate(&path, size).await?;
        }
        let meta = self.fs.get_metadata(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &meta, &req),
        })
    }

    async fn mknod(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name).await?;
        self.fs.create_empty(&path).await?;
        self.entry(&req, &path).await
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name).await?;
        self.fs.make_directory(&path).await?;
        self.entry(&req, &path).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name).await?;
        self.fs.remove(&path).await?;
        self.inodes.remove(&path).await;
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name).await?;
        self.fs.remove_directory(&path).await?;
        self.inodes.remove(&path).await;
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name).await?;
        let new = self.child_path(new_parent, new_name).await?;
        self.fs.rename(&old, &new).await?;
        self.inodes.rename(&old, &new).await;
        Ok(())
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino).await?;
        let fh = self.fs.open(&path, flags).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self.fs.read(fh, offset, size as usize).await?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let n = self.fs.write(fh, offset, data).await?;
        Ok(ReplyWrite {
            written: n as u32,
        })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // the remote service exposes no capacity figures
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        flush: bool,
    ) -> FuseResult<()> {
        Ok(self.release_handle(fh, flush).await?)
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        self.fs.flush(fh).await?;
        Ok(())
    }

    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        self.fs.flush(fh).await?;
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.path_of(ino).await?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let (_, listing) = self.listing(ino, offset.max(0) as usize).await?;
        let mut entries = Vec::with_capacity(listing.len());
        for (i, name, path) in listing {
            let kind = if name == "." || name == ".." {
                FileType::Directory
            } else {
                match self.fs.node_kind(&path).await {
                    Ok(kind) => to_fuse_kind(kind),
                    Err(e) => {
                        debug!("no kind for {path}: {e}");
                        FileType::RegularFile
                    }
                }
            };
            entries.push(DirectoryEntry {
                inode: self.inodes.ino_for(&path).await,
                kind,
                name: OsString::from(name),
                offset: i as i64 + 1,
            });
        }
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let entries = self
            .resolved_listing(ino, offset as usize)
            .await?
            .into_iter()
            .map(|(i, name, child_ino, meta)| DirectoryEntryPlus {
                inode: child_ino,
                generation: 0,
                kind: to_fuse_kind(meta.kind),
                name: OsString::from(name),
                offset: i as i64 + 1,
                attr: to_fuse_attr(child_ino, &meta, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            })
            .collect::<Vec<_>>();
        let entries: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name).await?;
        self.fs.create_empty(&path).await?;
        let fh = self.fs.open(&path, flags).await?;
        let meta = match self.fs.get_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                let _ = self.fs.release(fh).await;
                return Err(e.into());
            }
        };
        let ino = self.inodes.intern(&path).await;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: to_fuse_attr(ino, &meta, &req),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn to_fuse_kind(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, meta: &Metadata, req: &Request) -> FileAttr {
    let mtime = Timestamp::from(meta.mtime);
    FileAttr {
        ino,
        size: meta.size,
        blocks: meta.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: to_fuse_kind(meta.kind),
        perm: meta.perm,
        nlink: meta.nlink,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
