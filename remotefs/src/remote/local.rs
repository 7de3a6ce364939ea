//! `RemoteFs` served from a directory on local disk.
//!
//! Behaves like the gRPC service: an absent path whose parent directory exists
//! is reported as a successful Stat with `directory_missing` set, while an
//! absent parent fails the Stat itself. Put replaces content by writing a
//! hidden sibling file and renaming it over the target.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};

use super::{RemoteError, RemoteFileInfo, RemoteFs};
use crate::vpath::VirtualPath;

#[derive(Clone, Debug)]
pub struct LocalDirRemote {
    root: PathBuf,
}

impl LocalDirRemote {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, p: &VirtualPath) -> PathBuf {
        self.root.join(p.relative())
    }
}

#[async_trait]
impl RemoteFs for LocalDirRemote {
    async fn stat(&self, path: &VirtualPath) -> Result<RemoteFileInfo, RemoteError> {
        match fs::metadata(self.path_for(path)).await {
            Ok(md) => {
                let mod_time = md.modified()?;
                // whole seconds, as carried on the wire
                let secs = mod_time
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                Ok(RemoteFileInfo {
                    is_directory: md.is_dir(),
                    directory_missing: false,
                    size: if md.is_dir() { 0 } else { md.len() },
                    mod_time: super::unix_secs_to_time(secs),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent = path.parent().unwrap_or_else(VirtualPath::root);
                if fs::metadata(self.path_for(&parent)).await.is_ok_and(|md| md.is_dir()) {
                    Ok(RemoteFileInfo::missing())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, path: &VirtualPath) -> Result<Vec<u8>, RemoteError> {
        Ok(fs::read(self.path_for(path)).await?)
    }

    async fn put(&self, path: &VirtualPath, contents: Vec<u8>) -> Result<(), RemoteError> {
        let target = self.path_for(path);
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot put to root"))?;
        let tmp = target.with_file_name(format!(".{name}.{}.put", uuid::Uuid::new_v4()));
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&contents).await?;
        f.sync_all().await?;
        drop(f);
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn mkdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        Ok(fs::create_dir(self.path_for(path)).await?)
    }

    async fn rmdir(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        Ok(fs::remove_dir(self.path_for(path)).await?)
    }

    async fn unlink(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        Ok(fs::remove_file(self.path_for(path)).await?)
    }

    async fn rename(&self, old: &VirtualPath, new: &VirtualPath) -> Result<(), RemoteError> {
        Ok(fs::rename(self.path_for(old), self.path_for(new)).await?)
    }

    async fn read_dir(&self, path: &VirtualPath) -> Result<Vec<String>, RemoteError> {
        let mut rd = fs::read_dir(self.path_for(path)).await?;
        let mut names = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn stat_reports_missing_child_and_fails_on_missing_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = LocalDirRemote::new(tmp.path());
        let info = remote.stat(&vp("/nope")).await.unwrap();
        assert!(info.directory_missing);
        assert!(remote.stat(&vp("/nope/deeper")).await.is_err());

        let root = remote.stat(&VirtualPath::root()).await.unwrap();
        assert!(root.is_directory && !root.directory_missing);
    }

    #[tokio::test]
    async fn put_get_and_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = LocalDirRemote::new(tmp.path());
        remote.mkdir(&vp("/d")).await.unwrap();
        remote.put(&vp("/d/y"), b"yy".to_vec()).await.unwrap();
        remote.put(&vp("/d/x"), b"x".to_vec()).await.unwrap();
        assert_eq!(remote.get(&vp("/d/y")).await.unwrap(), b"yy");
        assert_eq!(remote.read_dir(&vp("/d")).await.unwrap(), vec!["x", "y"]);

        let info = remote.stat(&vp("/d/y")).await.unwrap();
        assert_eq!(info.size, 2);
        assert!(!info.is_directory);

        remote.rename(&vp("/d/y"), &vp("/d/z")).await.unwrap();
        remote.unlink(&vp("/d/x")).await.unwrap();
        assert_eq!(remote.read_dir(&vp("/d")).await.unwrap(), vec!["z"]);
        assert!(remote.rmdir(&vp("/d")).await.is_err());
        remote.unlink(&vp("/d/z")).await.unwrap();
        remote.rmdir(&vp("/d")).await.unwrap();
        assert!(remote.get(&vp("/d/z")).await.is_err());
    }
}
