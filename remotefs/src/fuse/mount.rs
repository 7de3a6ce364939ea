//! Mount helpers for starting/stopping FUSE
//!
//! Only supported on Linux. Unprivileged mounts go through fusermount3, which
//! must be in PATH.

use std::path::Path;
use std::sync::Arc;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};
use tracing::info;

use super::FuseFs;
use crate::config::MountConfig;
use crate::ops::CacheFs;
use crate::remote::RemoteFs;

fn mount_options(config: &MountConfig) -> MountOptions {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut mo = MountOptions::default();
    mo.fs_name("remotefs").uid(uid).gid(gid);
    if config.allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mount `fs` on an existing, empty directory. The returned handle resolves
/// when the session ends; call `unmount` on it to stop early.
#[cfg(target_os = "linux")]
pub async fn mount_cache_fs<R>(
    fs: Arc<CacheFs<R>>,
    mount_point: impl AsRef<Path>,
    config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    R: RemoteFs + 'static,
{
    let mount_point = mount_point.as_ref();
    let session = Session::new(mount_options(config));
    let adapter = FuseFs::new(fs);
    info!(
        "mounting at {} (unprivileged: {}, allow_other: {})",
        mount_point.display(),
        config.unprivileged,
        config.allow_other
    );
    if config.unprivileged {
        session.mount_with_unprivileged(adapter, mount_point).await
    } else {
        session.mount(adapter, mount_point).await
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_cache_fs<R>(
    _fs: Arc<CacheFs<R>>,
    _mount_point: impl AsRef<Path>,
    _config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    R: RemoteFs + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
