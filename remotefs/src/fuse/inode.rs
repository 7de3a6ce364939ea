//! Inode numbers handed to the kernel, mapped to virtual paths.
//!
//! The remote service is purely path based, so inodes only exist on this
//! side. An inode is allocated on the first lookup of a path and dropped
//! when the kernel forgets every reference to it.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::vpath::VirtualPath;

pub const ROOT_INO: u64 = 1;

struct Node {
    path: VirtualPath,
    lookups: u64,
}

struct Inner {
    nodes: HashMap<u64, Node>,
    by_path: HashMap<VirtualPath, u64>,
    next: u64,
}

pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let mut by_path = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                path: VirtualPath::root(),
                lookups: 1,
            },
        );
        by_path.insert(VirtualPath::root(), ROOT_INO);
        Self {
            inner: RwLock::new(Inner {
                nodes,
                by_path,
                next: ROOT_INO + 1,
            }),
        }
    }

    pub async fn path_of(&self, ino: u64) -> Option<VirtualPath> {
        self.inner.read().await.nodes.get(&ino).map(|n| n.path.clone())
    }

    /// Inode for `path`, allocating one if needed. Counts as one kernel
    /// lookup reference.
    pub async fn intern(&self, path: &VirtualPath) -> u64 {
        self.acquire(path, 1).await
    }

    /// Inode for `path` without taking a kernel reference, as reported in
    /// plain readdir entries.
    pub async fn ino_for(&self, path: &VirtualPath) -> u64 {
        self.acquire(path, 0).await
    }

    async fn acquire(&self, path: &VirtualPath, refs: u64) -> u64 {
        let mut inner = self.inner.write().await;
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&ino) {
                node.lookups += refs;
            }
            return ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.nodes.insert(
            ino,
            Node {
                path: path.clone(),
                lookups: refs,
            },
        );
        inner.by_path.insert(path.clone(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the inode goes away at zero.
    pub async fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.inner.write().await;
        let gone = match inner.nodes.get_mut(&ino) {
            Some(node) => {
                node.lookups = node.lookups.saturating_sub(nlookup);
                node.lookups == 0
            }
            None => false,
        };
        if !gone {
            return;
        }
        if let Some(node) = inner.nodes.remove(&ino) {
            if inner.by_path.get(&node.path) == Some(&ino) {
                inner.by_path.remove(&node.path);
            }
        }
    }

    /// Unmap `path` and everything below it. Inode numbers stay valid for
    /// `forget` but no longer resolve.
    pub async fn remove(&self, path: &VirtualPath) {
        let mut inner = self.inner.write().await;
        let doomed: Vec<u64> = inner
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(path))
            .map(|(_, &ino)| ino)
            .collect();
        for ino in doomed {
            if ino == ROOT_INO {
                continue;
            }
            if let Some(node) = inner.nodes.remove(&ino) {
                inner.by_path.remove(&node.path);
            }
        }
    }

    /// Re-point `old` and its descendants at `new`, keeping their inode
    /// numbers. Whatever was mapped at `new` is unmapped first.
    pub async fn rename(&self, old: &VirtualPath, new: &VirtualPath) {
        self.remove(new).await;
        let mut inner = self.inner.write().await;
        let moved: Vec<(u64, VirtualPath)> = inner
            .nodes
            .iter()
            .filter_map(|(&ino, n)| n.path.rebase(old, new).map(|p| (ino, p)))
            .collect();
        for (ino, path) in moved {
            if let Some(node) = inner.nodes.get_mut(&ino) {
                let prev = std::mem::replace(&mut node.path, path.clone());
                inner.by_path.remove(&prev);
                inner.by_path.insert(path, ino);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }
}
