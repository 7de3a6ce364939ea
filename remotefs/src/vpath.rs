//! Virtual paths: absolute, slash-separated names in the remote namespace.

use std::fmt;

use crate::error::{FsError, Result};

/// An absolute path as seen by callers of the mounted filesystem.
///
/// Always starts with `/`, never ends with `/` (except the root itself), and
/// contains no empty, `.` or `..` components.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(String);

impl VirtualPath {
    pub fn root() -> Self {
        VirtualPath("/".to_string())
    }

    /// Parse and normalise an absolute path. Repeated and trailing slashes are
    /// collapsed.
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            return Err(FsError::InvalidPath(raw.to_string()));
        }
        let mut out = String::with_capacity(raw.len());
        for part in raw.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(FsError::InvalidPath(raw.to_string()));
            }
            out.push('/');
            out.push_str(part);
        }
        if out.is_empty() {
            return Ok(Self::root());
        }
        Ok(VirtualPath(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The path without its leading slash; empty for the root.
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    /// Append a single component.
    pub fn join(&self, name: &str) -> Result<Self> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::InvalidPath(format!("{}/{}", self.0, name)));
        }
        let mut s = self.0.clone();
        if !self.is_root() {
            s.push('/');
        }
        s.push_str(name);
        Ok(VirtualPath(s))
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(n) => Some(VirtualPath(self.0[..n].to_string())),
            None => None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// True when `self` is `other` or lies below it.
    pub fn starts_with(&self, other: &VirtualPath) -> bool {
        if other.is_root() || self == other {
            return true;
        }
        self.0
            .strip_prefix(other.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Move `self` from under `from` to under `to`. Returns `None` when `self`
    /// is not below `from`.
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = if from.is_root() {
            self.relative()
        } else {
            self.0[from.0.len()..].trim_start_matches('/')
        };
        if rest.is_empty() {
            return Some(to.clone());
        }
        let mut s = to.0.clone();
        if !to.is_root() {
            s.push('/');
        }
        s.push_str(rest);
        Some(VirtualPath(s))
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
