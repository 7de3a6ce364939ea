use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::vpath::VirtualPath;

/// Maps virtual paths under a fixed cache root.
#[derive(Clone, Debug)]
pub struct CachePathResolver {
    root: PathBuf,
}

impl CachePathResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Pure and injective: distinct virtual paths never share a local path.
    pub fn resolve(&self, path: &VirtualPath) -> PathBuf {
        if path.is_root() {
            self.root.clone()
        } else {
            self.root.join(path.relative())
        }
    }

    /// Create every missing ancestor directory of `local`. Existing
    /// directories are fine, so calling this twice is harmless.
    pub fn ensure_parents(local: &Path) -> io::Result<()> {
        match local.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_mirrors_namespace() {
        let r = CachePathResolver::new("/var/cache/rfs");
        let root = VirtualPath::root();
        assert_eq!(r.resolve(&root), PathBuf::from("/var/cache/rfs"));
        let p = VirtualPath::parse("/a/b.txt").unwrap();
        assert_eq!(r.resolve(&p), PathBuf::from("/var/cache/rfs/a/b.txt"));
    }

    #[test]
    fn ensure_parents_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let r = CachePathResolver::new(tmp.path());
        let local = r.resolve(&VirtualPath::parse("/x/y/z.txt").unwrap());

        CachePathResolver::ensure_parents(&local).unwrap();
        CachePathResolver::ensure_parents(&local).unwrap();
        assert!(tmp.path().join("x/y").is_dir());
        assert!(!local.exists());

        let entries: Vec<_> = fs::read_dir(tmp.path().join("x"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("y")]);
    }

    #[test]
    fn ensure_parents_propagates_other_failures() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("blocker"), b"").unwrap();
        let local = tmp.path().join("blocker/child/file");
        assert!(CachePathResolver::ensure_parents(&local).is_err());
    }
}
