//! Inode number <-> path mapping.
//!
//! The cache is addressed by path; the kernel speaks inode numbers. Numbers
//! are handed out on first lookup and never reused within a mount.

use crate::vfs::path;
use parking_lot::Mutex;
use std::collections::HashMap;

pub const ROOT_INO: u64 = 1;

struct Inner {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next: u64,
}

pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(ROOT_INO, "/".to_string());
        inos.insert("/".to_string(), ROOT_INO);
        Self {
            inner: Mutex::new(Inner {
                paths,
                inos,
                next: ROOT_INO + 1,
            }),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.inner.lock().paths.get(&ino).cloned()
    }

    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path_of(parent).map(|p| path::join(&p, name))
    }

    /// Inode for `path`, allocating one on first sight.
    pub fn ino_of(&self, path: &str) -> u64 {
        let mut inner = self.inner.lock();
        if let Some(ino) = inner.inos.get(path) {
            return *ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.paths.insert(ino, path.to_string());
        inner.inos.insert(path.to_string(), ino);
        ino
    }

    pub fn parent_of(&self, ino: u64) -> u64 {
        match self.path_of(ino).as_deref().and_then(path::split_parent) {
            Some((parent, _)) => self.ino_of(&parent),
            None => ROOT_INO,
        }
    }

    pub fn forget(&self, path: &str) {
        let mut inner = self.inner.lock();
        if let Some(ino) = inner.inos.remove(path) {
            inner.paths.remove(&ino);
        }
    }

    /// Forget `path` and everything below it.
    pub fn forget_tree(&self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut inner = self.inner.lock();
        let gone: Vec<String> = inner
            .inos
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in gone {
            if let Some(ino) = inner.inos.remove(&p) {
                inner.paths.remove(&ino);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_stable() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
        let dcim = table.ino_of("/DCIM");
        assert_eq!(table.ino_of("/DCIM"), dcim);
        assert_ne!(dcim, ROOT_INO);
        assert_eq!(table.child_path(dcim, "a.jpg").as_deref(), Some("/DCIM/a.jpg"));
        assert_eq!(table.child_path(ROOT_INO, "DCIM").as_deref(), Some("/DCIM"));
        assert_eq!(table.parent_of(dcim), ROOT_INO);
        assert_eq!(table.parent_of(ROOT_INO), ROOT_INO);
    }

    #[test]
    fn test_forget_tree_keeps_siblings() {
        let table = InodeTable::new();
        let a = table.ino_of("/DCIM");
        let b = table.ino_of("/DCIM/100CAMFS");
        let c = table.ino_of("/DCIMX");
        table.forget_tree("/DCIM");
        assert!(table.path_of(a).is_none());
        assert!(table.path_of(b).is_none());
        assert_eq!(table.path_of(c).as_deref(), Some("/DCIMX"));
        // Never reused.
        assert!(table.ino_of("/DCIM") > c);
    }
}
