//! Open file handles.
//!
//! A handle pins its file node and remembers where the file lives on the
//! device, so write-back works even after the tree was invalidated.

use super::node::FileNode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct OpenFile<H> {
    pub file: Arc<FileNode<H>>,
    pub folder: String,
    pub writeable: bool,
}

impl<H> Clone for OpenFile<H> {
    fn clone(&self) -> Self {
        Self {
            file: self.file.clone(),
            folder: self.folder.clone(),
            writeable: self.writeable,
        }
    }
}

pub struct HandleTable<H> {
    next: AtomicU64,
    open: Mutex<HashMap<u64, OpenFile<H>>>,
}

impl<H> Default for HandleTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> HandleTable<H> {
    pub fn new() -> Self {
        Self {
            // 0 is what FUSE sends when there is no handle.
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, entry: OpenFile<H>) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(fh, entry);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<OpenFile<H>> {
        self.open.lock().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<OpenFile<H>> {
        self.open.lock().remove(&fh)
    }

    pub fn drain(&self) -> Vec<(u64, OpenFile<H>)> {
        self.open.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileInfo;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_handles_are_unique_and_removable() {
        let table: HandleTable<()> = HandleTable::new();
        let file = FileNode::from_device(FileInfo {
            name: "a.jpg".into(),
            size: 0,
            mtime: UNIX_EPOCH,
        });
        let entry = OpenFile {
            file,
            folder: "/".into(),
            writeable: false,
        };
        let a = table.insert(entry.clone());
        let b = table.insert(entry);
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
    }
}
