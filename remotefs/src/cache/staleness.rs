//! Cache staleness decision.
//!
//! The local file's own mtime is the witness: it is written when content is
//! fetched or committed, so a local copy is fresh as long as its mtime is not
//! older than the remote modification time. Both sides are compared at whole
//! second resolution, the precision the service reports. Ties keep the local
//! copy.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::remote::RemoteFileInfo;

fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Strictly newer remote content means stale.
pub fn is_stale(remote_mtime: SystemTime, local_mtime: SystemTime) -> bool {
    unix_secs(remote_mtime) > unix_secs(local_mtime)
}

/// Decide whether `local` must be re-fetched before serving reads.
///
/// Directories never need a content refresh. A missing local entry always
/// does. Any other failure to inspect the local entry is returned.
pub fn needs_refresh(remote: &RemoteFileInfo, local: &Path) -> io::Result<bool> {
    if remote.is_directory {
        return Ok(false);
    }
    match fs::metadata(local) {
        Ok(md) => Ok(is_stale(remote.mod_time, md.modified()?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}
