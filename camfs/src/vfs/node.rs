//! In-memory mirror of the device's folder tree.
//!
//! Directories are owned by their parent (`DirNode` holds child `DirNode`s by
//! value), so the whole tree lives behind one lock in the session. File nodes
//! are `Arc`ed because open handles keep them alive; their mutable state sits
//! behind a per-file async lock so that device round trips for one file never
//! block the tree.

use super::error::{VfsError, VfsResult};
use crate::device::FileInfo;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

/// Buffered content of a file.
#[derive(Debug)]
pub enum Content {
    /// Not in memory; the device copy is current.
    Cold,
    /// Loaded and identical to the device copy.
    Clean(Vec<u8>),
    /// Modified locally, not yet written back.
    Dirty(Vec<u8>),
}

impl Content {
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty(_))
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Cold => None,
            Self::Clean(b) | Self::Dirty(b) => Some(b),
        }
    }

    /// Buffer for mutation, flipping the content to dirty. `None` when cold.
    pub fn make_dirty(&mut self) -> Option<&mut Vec<u8>> {
        if let Self::Clean(buf) = self {
            *self = Self::Dirty(std::mem::take(buf));
        }
        match self {
            Self::Dirty(buf) => Some(buf),
            _ => None,
        }
    }

    /// After a successful write-back: keep the bytes as clean or drop them.
    pub fn settle(&mut self, keep: bool) {
        if let Self::Dirty(buf) = std::mem::replace(self, Self::Cold) {
            if keep {
                *self = Self::Clean(buf);
            }
        }
    }
}

pub struct FileState<H> {
    pub size: u64,
    pub mtime: SystemTime,
    pub content: Content,
    /// Device side handle; present while open, or while dirty data waits
    /// for a successful write-back.
    pub handle: Option<H>,
    /// Set once the node has left the tree. Openers that raced with the
    /// removal see it and resolve the path again.
    pub detached: bool,
}

pub struct FileNode<H> {
    name: String,
    /// Mutated only while the state lock is held; readable without it.
    open: AtomicU32,
    state: Mutex<FileState<H>>,
}

impl<H> FileNode<H> {
    pub fn from_device(info: FileInfo) -> Arc<Self> {
        Arc::new(Self {
            name: info.name,
            open: AtomicU32::new(0),
            state: Mutex::new(FileState {
                size: info.size,
                mtime: info.mtime,
                content: Content::Cold,
                handle: None,
                detached: false,
            }),
        })
    }

    /// A file that exists only locally, already opened once by its creator.
    pub fn created(name: &str, handle: H) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            open: AtomicU32::new(1),
            state: Mutex::new(FileState {
                size: 0,
                mtime: SystemTime::now(),
                content: Content::Dirty(Vec::new()),
                handle: Some(handle),
                detached: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open_count(&self) -> u32 {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn lock(&self) -> MutexGuard<'_, FileState<H>> {
        self.state.lock().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, FileState<H>>> {
        self.state.try_lock().ok()
    }

    /// Count one more open. The state borrow proves the lock is held.
    pub fn acquire(&self, _state: &mut FileState<H>) {
        self.open.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one close and return how many opens remain.
    pub fn release(&self, _state: &mut FileState<H>) -> u32 {
        let n = self.open.load(Ordering::SeqCst);
        if n == 0 {
            error!("release of {} without a matching open", self.name);
            panic!("open count underflow on {}", self.name);
        }
        self.open.store(n - 1, Ordering::SeqCst);
        n - 1
    }
}

impl<H> Drop for FileNode<H> {
    fn drop(&mut self) {
        let n = *self.open.get_mut();
        if n > 0 {
            error!("file node {} dropped while open {n} times", self.name);
        }
    }
}

/// A file taken out of the tree, with the folder it lived in.
pub struct Orphan<H> {
    pub folder: String,
    pub file: Arc<FileNode<H>>,
}

pub struct DirNode<H> {
    name: String,
    listed: bool,
    /// A device removal of this folder is in flight.
    removing: bool,
    dirs: BTreeMap<String, DirNode<H>>,
    files: BTreeMap<String, Arc<FileNode<H>>>,
}

impl<H> DirNode<H> {
    /// Known to exist; children not read from the device yet.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            listed: false,
            removing: false,
            dirs: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    /// Freshly created on the device, so known to be empty.
    pub fn new_listed(name: &str) -> Self {
        Self {
            listed: true,
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_listed(&self) -> bool {
        self.listed
    }

    pub fn mark_listed(&mut self) {
        self.listed = true;
    }

    pub fn set_removing(&mut self, removing: bool) {
        self.removing = removing;
    }

    /// Whether this directory or any directory down to `segs` is being removed.
    pub fn removing_on_path(&self, segs: &[&str]) -> bool {
        let mut cur = self;
        if cur.removing {
            return true;
        }
        for seg in segs {
            match cur.dirs.get(*seg) {
                Some(next) => cur = next,
                None => return false,
            }
            if cur.removing {
                return true;
            }
        }
        false
    }

    pub fn dir(&self, name: &str) -> Option<&DirNode<H>> {
        self.dirs.get(name)
    }

    pub fn file(&self, name: &str) -> Option<&Arc<FileNode<H>>> {
        self.files.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dirs.contains_key(name) || self.files.contains_key(name)
    }

    pub fn subdirs(&self) -> impl Iterator<Item = &DirNode<H>> {
        self.dirs.values()
    }

    pub fn files(&self) -> impl Iterator<Item = &Arc<FileNode<H>>> {
        self.files.values()
    }

    pub fn descend(&self, segs: &[&str]) -> Option<&DirNode<H>> {
        segs.iter().try_fold(self, |dir, seg| dir.dirs.get(*seg))
    }

    pub fn descend_mut(&mut self, segs: &[&str]) -> Option<&mut DirNode<H>> {
        segs.iter().try_fold(self, |dir, seg| dir.dirs.get_mut(*seg))
    }

    pub fn insert_dir(&mut self, dir: DirNode<H>) -> VfsResult<()> {
        if self.contains(&dir.name) {
            return Err(VfsError::AlreadyExists(dir.name));
        }
        self.dirs.insert(dir.name.clone(), dir);
        Ok(())
    }

    pub fn insert_file(&mut self, file: Arc<FileNode<H>>) -> VfsResult<()> {
        if self.contains(file.name()) {
            return Err(VfsError::AlreadyExists(file.name().to_string()));
        }
        self.files.insert(file.name().to_string(), file);
        Ok(())
    }

    /// Add a device-reported folder unless one by that name is cached already.
    pub fn adopt_dir(&mut self, name: String) {
        if self.files.contains_key(&name) {
            warn!("folder {name} in {} shadows a cached file, skipped", self.name);
            return;
        }
        self.dirs
            .entry(name)
            .or_insert_with_key(|name| DirNode::new(name));
    }

    /// Add a device-reported file unless the name is already taken.
    pub fn adopt_file(&mut self, info: FileInfo) {
        if self.dirs.contains_key(&info.name) {
            warn!(
                "file {} in {} has the name of a folder, skipped",
                info.name, self.name
            );
            return;
        }
        if !self.files.contains_key(&info.name) {
            self.files
                .insert(info.name.clone(), FileNode::from_device(info));
        }
    }

    /// Unlink a file node. Removing an open file is a bookkeeping bug.
    pub fn remove_file(&mut self, name: &str) -> VfsResult<Arc<FileNode<H>>> {
        let open = match self.files.get(name) {
            None => return Err(VfsError::NotFound(name.to_string())),
            Some(f) => f.open_count(),
        };
        if open > 0 {
            error!("attempt to destroy {name} while open {open} times");
            panic!("destroying open file node {name}");
        }
        self.files
            .remove(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    /// Detach a whole subtree. Files below it are returned so the caller can
    /// mark them detached.
    pub fn remove_dir(&mut self, name: &str, folder: &str) -> VfsResult<Vec<Orphan<H>>> {
        let mut dir = self
            .dirs
            .remove(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        let mut out = Vec::new();
        dir.drain(folder, &mut out);
        Ok(out)
    }

    /// Drop every cached child and return to the unlisted state.
    pub fn reset(&mut self, folder: &str) -> Vec<Orphan<H>> {
        let mut out = Vec::new();
        self.drain(folder, &mut out);
        self.listed = false;
        out
    }

    fn drain(&mut self, folder: &str, out: &mut Vec<Orphan<H>>) {
        for (_, file) in std::mem::take(&mut self.files) {
            out.push(Orphan {
                folder: folder.to_string(),
                file,
            });
        }
        for (name, mut dir) in std::mem::take(&mut self.dirs) {
            dir.drain(&super::path::join(folder, &name), out);
        }
    }

    /// Any file below that is open right now.
    pub fn has_open_files(&self) -> bool {
        self.files.values().any(|f| f.open_count() > 0)
            || self.dirs.values().any(DirNode::has_open_files)
    }

    /// Lock every file below that is closed and clean. Returns `false` as
    /// soon as one is open, dirty, or locked by someone else, or when a
    /// folder below is being removed.
    pub fn lock_idle_files<'a>(&'a self, out: &mut Vec<MutexGuard<'a, FileState<H>>>) -> bool {
        if self.removing {
            return false;
        }
        for file in self.files.values() {
            if file.open_count() > 0 {
                return false;
            }
            match file.try_lock() {
                Some(state) if !state.content.is_dirty() => out.push(state),
                _ => return false,
            }
        }
        self.dirs.values().all(|d| d.lock_idle_files(out))
    }
}
