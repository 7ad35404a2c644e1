//! Session context: the cached tree, the device it mirrors and the
//! directory level operations.
//!
//! Lock order is file state, then tree. The tree lock is synchronous and is
//! never held across an await; per-file locks are async because they are
//! held for the duration of that file's device round trips.

use super::attr::{DirEntry, FileAttr, Identity, StatFs};
use super::cache::CapacityCache;
use super::error::{VfsError, VfsResult};
use super::handles::HandleTable;
use super::node::{Content, DirNode, FileNode, Orphan};
use super::path;
use super::resolve::Target;
use crate::device::DeviceService;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub owner: Identity,
    /// 0 turns the capacity cache off.
    pub capacity_ttl: Duration,
    /// Largest size a buffered file may grow to.
    pub max_file_size: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            owner: Identity::current(),
            capacity_ttl: Duration::from_secs(5),
            max_file_size: 4 << 30,
        }
    }
}

pub struct Session<D: DeviceService> {
    pub(super) device: D,
    pub(super) owner: Identity,
    pub(super) max_file_size: u64,
    pub(super) tree: Mutex<DirNode<D::Handle>>,
    pub(super) populate_gate: tokio::sync::Mutex<()>,
    pub(super) handles: HandleTable<D::Handle>,
    pub(super) capacity: CapacityCache,
}

impl<D: DeviceService> Session<D> {
    pub fn new(device: D, opts: SessionOptions) -> Self {
        Self {
            device,
            owner: opts.owner,
            max_file_size: opts.max_file_size,
            tree: Mutex::new(DirNode::new("")),
            populate_gate: tokio::sync::Mutex::new(()),
            handles: HandleTable::new(),
            capacity: CapacityCache::new(opts.capacity_ttl),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn owner(&self) -> Identity {
        self.owner
    }

    pub async fn getattr(&self, path: &str) -> VfsResult<FileAttr> {
        let segs = path::segments(path);
        match self.resolve(&segs).await? {
            Some(Target::Dir) => Ok(FileAttr::dir(self.owner)),
            Some(Target::File(file)) => Ok(self.file_attr(&file).await),
            None => Err(VfsError::NotFound(path::folder_of(&segs))),
        }
    }

    pub(super) async fn file_attr(&self, file: &FileNode<D::Handle>) -> FileAttr {
        let st = file.lock().await;
        FileAttr::file(self.owner, st.size, st.mtime)
    }

    /// `.`, `..`, then folders, then files.
    pub async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let segs = path::segments(path);
        self.expect_dir(&segs).await?;
        self.ensure_listed(&segs).await?;

        let (dirs, files) = {
            let tree = self.tree.lock();
            let dir = tree
                .descend(&segs)
                .ok_or_else(|| VfsError::NotFound(path::folder_of(&segs)))?;
            let dirs: Vec<String> = dir.subdirs().map(|d| d.name().to_string()).collect();
            let files: Vec<Arc<FileNode<D::Handle>>> = dir.files().cloned().collect();
            (dirs, files)
        };

        let dir_attr = FileAttr::dir(self.owner);
        let mut out = Vec::with_capacity(dirs.len() + files.len() + 2);
        for name in [".", ".."] {
            out.push(DirEntry {
                name: name.to_string(),
                attr: dir_attr.clone(),
            });
        }
        out.extend(dirs.into_iter().map(|name| DirEntry {
            name,
            attr: dir_attr.clone(),
        }));
        for file in files {
            out.push(DirEntry {
                name: file.name().to_string(),
                attr: self.file_attr(&file).await,
            });
        }
        Ok(out)
    }

    pub async fn mkdir(&self, path: &str) -> VfsResult<FileAttr> {
        let segs = path::segments(path);
        let Some((name, parent)) = segs.split_last() else {
            return Err(VfsError::AlreadyExists("/".into()));
        };
        if !path::is_valid_name(name) {
            return Err(VfsError::InvalidArgument((*name).to_string()));
        }
        self.expect_dir(parent).await?;
        if self.resolve(&segs).await?.is_some() {
            return Err(VfsError::AlreadyExists(path::folder_of(&segs)));
        }
        Self::check_not_removing(&self.tree.lock(), parent)?;

        let folder = path::folder_of(parent);
        self.device.create_folder(&folder, name).await?;
        self.capacity.invalidate();

        let mut tree = self.tree.lock();
        if let Some(dir) = tree.descend_mut(parent) {
            // An unlisted parent will pick the folder up from the device.
            if dir.is_listed() && !dir.contains(name) {
                dir.insert_dir(DirNode::new_listed(name))?;
            }
        }
        debug!("created folder {}", path::folder_of(&segs));
        Ok(FileAttr::dir(self.owner))
    }

    pub async fn rmdir(&self, path: &str) -> VfsResult<()> {
        let segs = path::segments(path);
        let Some((name, parent)) = segs.split_last() else {
            return Err(VfsError::Busy("/".into()));
        };
        let full = path::folder_of(&segs);
        self.expect_dir(&segs).await?;
        {
            // Checked and marked under one tree lock.
            let mut tree = self.tree.lock();
            let idle = match tree.descend(&segs) {
                Some(dir) => dir.lock_idle_files(&mut Vec::new()),
                None => return Err(VfsError::NotFound(full)),
            };
            if !idle || tree.removing_on_path(&segs) {
                return Err(VfsError::Busy(full));
            }
            if let Some(dir) = tree.descend_mut(&segs) {
                dir.set_removing(true);
            }
        }

        if let Err(e) = self.device.remove_folder(&path::folder_of(parent), name).await {
            if let Some(dir) = self.tree.lock().descend_mut(&segs) {
                dir.set_removing(false);
            }
            return Err(e.into());
        }
        self.capacity.invalidate();

        let orphans = {
            let mut tree = self.tree.lock();
            match tree.descend_mut(parent) {
                Some(dir) => dir.remove_dir(name, &full).unwrap_or_default(),
                None => Vec::new(),
            }
        };
        self.detach(orphans).await;
        debug!("removed folder {full}");
        Ok(())
    }

    /// Refuse to attach anything below a folder whose removal is in flight.
    pub(super) fn check_not_removing(tree: &DirNode<D::Handle>, segs: &[&str]) -> VfsResult<()> {
        if tree.removing_on_path(segs) {
            return Err(VfsError::Busy(path::folder_of(segs)));
        }
        Ok(())
    }

    pub async fn statfs(&self) -> VfsResult<StatFs> {
        let cap = self
            .capacity
            .get_or_fetch(self.device.storage_capacity())
            .await?;
        Ok(cap.into())
    }

    /// Forget what is cached below `path` so the next access lists the
    /// device again. Refused while a file below is open or dirty.
    pub async fn invalidate(&self, path: &str) -> VfsResult<()> {
        let segs = path::segments(path);
        let folder = path::folder_of(&segs);
        self.expect_dir(&segs).await?;

        let orphans = {
            let mut tree = self.tree.lock();
            let dir = tree
                .descend(&segs)
                .ok_or_else(|| VfsError::NotFound(folder.clone()))?;
            let mut idle = Vec::new();
            if !dir.lock_idle_files(&mut idle) {
                return Err(VfsError::Busy(folder));
            }
            // Marked while still locked, so a racing open retries its lookup.
            for st in idle.iter_mut() {
                st.detached = true;
            }
            drop(idle);
            tree.descend_mut(&segs)
                .map(|dir| dir.reset(&folder))
                .unwrap_or_default()
        };
        self.capacity.invalidate();
        info!("invalidated {folder}, dropped {} cached files", orphans.len());
        Ok(())
    }

    /// Flag removed files so openers holding a stale reference look again,
    /// and give back device handles nobody uses any more.
    pub(super) async fn detach(&self, orphans: Vec<Orphan<D::Handle>>) {
        for orphan in orphans {
            let mut st = orphan.file.lock().await;
            st.detached = true;
            if orphan.file.open_count() == 0 {
                if st.content.is_dirty() {
                    warn!(
                        "dropping unsaved changes to {}",
                        path::join(&orphan.folder, orphan.file.name())
                    );
                }
                st.content = Content::Cold;
                if let Some(handle) = st.handle.take() {
                    self.device.release(handle);
                }
            }
        }
    }

    /// Write back whatever is dirty, release every device handle and drop
    /// the tree. Changes that cannot be saved are logged and lost.
    pub async fn teardown(&self) {
        let open = self.handles.drain();
        if !open.is_empty() {
            warn!("{} file handles still open at teardown", open.len());
        }
        let mut files: Vec<Orphan<D::Handle>> = Vec::new();
        for (_, entry) in open {
            let mut st = entry.file.lock().await;
            entry.file.release(&mut st);
            drop(st);
            if !files.iter().any(|o| Arc::ptr_eq(&o.file, &entry.file)) {
                files.push(Orphan {
                    folder: entry.folder,
                    file: entry.file,
                });
            }
        }
        let mut old = std::mem::replace(&mut *self.tree.lock(), DirNode::new(""));
        for orphan in old.reset("/") {
            if !files.iter().any(|o| Arc::ptr_eq(&o.file, &orphan.file)) {
                files.push(orphan);
            }
        }

        let mut lost = 0;
        for orphan in &files {
            let mut st = orphan.file.lock().await;
            st.detached = true;
            if st.content.is_dirty() {
                let name = orphan.file.name();
                if let Err(e) = self.write_back(&mut st, &orphan.folder, name).await {
                    warn!(
                        "unsaved changes to {} lost: {e}",
                        path::join(&orphan.folder, name)
                    );
                    lost += 1;
                }
            }
            st.content = Content::Cold;
            if let Some(handle) = st.handle.take() {
                self.device.release(handle);
            }
        }
        info!(
            "session closed, {} cached files dropped, {lost} with unsaved changes",
            files.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::MemoryHandle;
    use crate::device::{Capacity, DeviceErrorKind, DeviceOp, DeviceResult, FileInfo, MemoryDevice};
    use crate::vfs::FileType;
    use async_trait::async_trait;

    /// Memory camera whose folder removal takes a while.
    struct SlowRemove(MemoryDevice);

    #[async_trait]
    impl DeviceService for SlowRemove {
        type Handle = MemoryHandle;

        async fn list_subfolders(&self, folder: &str) -> DeviceResult<Vec<String>> {
            self.0.list_subfolders(folder).await
        }

        async fn list_files(&self, folder: &str) -> DeviceResult<Vec<FileInfo>> {
            self.0.list_files(folder).await
        }

        async fn create_folder(&self, parent: &str, name: &str) -> DeviceResult<()> {
            self.0.create_folder(parent, name).await
        }

        async fn remove_folder(&self, parent: &str, name: &str) -> DeviceResult<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.remove_folder(parent, name).await
        }

        async fn fetch_file_content(&self, folder: &str, name: &str) -> DeviceResult<MemoryHandle> {
            self.0.fetch_file_content(folder, name).await
        }

        fn new_file_handle(&self, folder: &str, name: &str) -> MemoryHandle {
            self.0.new_file_handle(folder, name)
        }

        async fn read_all(&self, handle: &MemoryHandle) -> DeviceResult<Vec<u8>> {
            self.0.read_all(handle).await
        }

        async fn replace_content(&self, handle: &mut MemoryHandle, data: Vec<u8>) -> DeviceResult<()> {
            self.0.replace_content(handle, data).await
        }

        async fn delete_file(&self, folder: &str, name: &str) -> DeviceResult<()> {
            self.0.delete_file(folder, name).await
        }

        fn release(&self, handle: MemoryHandle) {
            self.0.release(handle)
        }

        async fn storage_capacity(&self) -> DeviceResult<Capacity> {
            self.0.storage_capacity().await
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            owner: Identity {
                uid: 1000,
                gid: 100,
            },
            capacity_ttl: Duration::from_secs(60),
            max_file_size: 1 << 20,
        }
    }

    fn camera() -> Session<MemoryDevice> {
        let dev = MemoryDevice::new();
        dev.seed_file("/DCIM/100CAMFS", "IMG_0001.JPG", b"jpegdata");
        Session::new(dev, options())
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_lazy_population_is_idempotent() {
        let s = camera();
        let attr = s.getattr("/DCIM/100CAMFS/IMG_0001.JPG").await.unwrap();
        assert_eq!(attr.size, 8);
        assert_eq!(attr.perm, 0o644);
        assert_eq!((attr.uid, attr.gid), (1000, 100));
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 3);
        assert_eq!(s.device().calls(DeviceOp::ListFiles), 3);

        s.getattr("/DCIM/100CAMFS/IMG_0001.JPG").await.unwrap();
        s.readdir("/DCIM/100CAMFS").await.unwrap();
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 3);
        assert_eq!(s.device().calls(DeviceOp::ListFiles), 3);
    }

    #[tokio::test]
    async fn test_readdir_lists_only_what_is_needed() {
        let dev = MemoryDevice::new();
        dev.seed_folder("/DCIM/100CAMFS");
        let s = Session::new(dev, options());

        let root = s.readdir("/").await.unwrap();
        assert_eq!(names(&root), vec![".", "..", "DCIM"]);
        assert_eq!(root[2].attr.kind, FileType::Dir);
        assert_eq!(root[2].attr.nlink, 2);
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 1);
        assert_eq!(s.device().calls(DeviceOp::ListFiles), 1);

        s.readdir("/").await.unwrap();
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 1);
    }

    #[tokio::test]
    async fn test_folders_come_before_files() {
        let dev = MemoryDevice::new();
        dev.seed_file("/", "a.txt", b"x");
        dev.seed_folder("/z");
        let s = Session::new(dev, options());
        let entries = s.readdir("/").await.unwrap();
        assert_eq!(names(&entries), vec![".", "..", "z", "a.txt"]);
        assert_eq!(entries[3].attr.blocks(), 1);
    }

    #[tokio::test]
    async fn test_missing_paths_and_kind_mismatches() {
        let s = camera();
        let err = s.getattr("/DCIM/nope").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        let err = s.readdir("/DCIM/100CAMFS/IMG_0001.JPG").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR);
        let err = s
            .getattr("/DCIM/100CAMFS/IMG_0001.JPG/x")
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn test_population_error_propagates_and_is_retried() {
        let s = camera();
        s.device()
            .fail_next(DeviceOp::ListFiles, DeviceErrorKind::CameraBusy);
        let err = s.getattr("/DCIM").await.unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);

        s.getattr("/DCIM").await.unwrap();
        assert_eq!(s.device().calls(DeviceOp::ListFiles), 2);
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 2);
        // Retrying did not duplicate the folder committed by the first try.
        assert_eq!(names(&s.readdir("/").await.unwrap()), vec![".", "..", "DCIM"]);
    }

    #[tokio::test]
    async fn test_concurrent_readers_list_once() {
        let s = camera();
        let (a, b) = tokio::join!(s.readdir("/DCIM"), s.readdir("/DCIM"));
        assert_eq!(names(&a.unwrap()), names(&b.unwrap()));
        // Root and /DCIM, once each.
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 2);
        assert_eq!(s.device().calls(DeviceOp::ListFiles), 2);
    }

    #[tokio::test]
    async fn test_mkdir_then_readdir_needs_no_listing() {
        let s = camera();
        s.readdir("/").await.unwrap();
        let attr = s.mkdir("/new").await.unwrap();
        assert_eq!(attr.kind, FileType::Dir);
        assert!(s.device().has_folder("/new"));

        assert_eq!(names(&s.readdir("/new").await.unwrap()), vec![".", ".."]);
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 1);
        assert_eq!(s.device().calls(DeviceOp::ListFiles), 1);

        let err = s.mkdir("/new").await.unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
        let err = s.mkdir("/nope/deeper").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn test_rmdir() {
        let s = camera();
        s.mkdir("/empty").await.unwrap();
        s.rmdir("/empty").await.unwrap();
        assert!(!s.device().has_folder("/empty"));
        assert_eq!(
            s.getattr("/empty").await.unwrap_err().errno(),
            libc::ENOENT
        );

        // The device refuses, the cache keeps the folder.
        let err = s.rmdir("/DCIM").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);
        s.getattr("/DCIM/100CAMFS").await.unwrap();

        assert_eq!(s.rmdir("/").await.unwrap_err().errno(), libc::EBUSY);
    }

    #[tokio::test]
    async fn test_rmdir_refused_while_a_file_below_is_open() {
        let s = camera();
        let fh = s.open("/DCIM/100CAMFS/IMG_0001.JPG", false).await.unwrap();
        let err = s.rmdir("/DCIM/100CAMFS").await.unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);
        assert_eq!(s.device().calls(DeviceOp::RemoveFolder), 0);
        s.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_statfs_is_cached_until_the_device_changes() {
        let s = Session::new(MemoryDevice::with_capacity_kb(2048), options());
        let st = s.statfs().await.unwrap();
        assert_eq!(st.blocks, 2048);
        assert_eq!(st.bsize, 1024);
        s.statfs().await.unwrap();
        assert_eq!(s.device().calls(DeviceOp::StorageCapacity), 1);

        s.mkdir("/x").await.unwrap();
        s.statfs().await.unwrap();
        assert_eq!(s.device().calls(DeviceOp::StorageCapacity), 2);
    }

    #[tokio::test]
    async fn test_invalidate_rereads_the_device() {
        let s = camera();
        assert_eq!(s.readdir("/DCIM/100CAMFS").await.unwrap().len(), 3);
        s.device()
            .seed_file("/DCIM/100CAMFS", "IMG_0002.JPG", b"more");
        assert_eq!(s.readdir("/DCIM/100CAMFS").await.unwrap().len(), 3);

        s.invalidate("/DCIM").await.unwrap();
        let entries = s.readdir("/DCIM/100CAMFS").await.unwrap();
        assert_eq!(
            names(&entries),
            vec![".", "..", "IMG_0001.JPG", "IMG_0002.JPG"]
        );
    }

    #[tokio::test]
    async fn test_invalidate_refused_while_busy() {
        let s = camera();
        let fh = s.open("/DCIM/100CAMFS/IMG_0001.JPG", false).await.unwrap();
        let err = s.invalidate("/").await.unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);
        s.release(fh).await.unwrap();
        s.invalidate("/").await.unwrap();
        // Resolving again lists from the root down.
        s.getattr("/DCIM/100CAMFS/IMG_0001.JPG").await.unwrap();
        assert_eq!(s.device().calls(DeviceOp::ListSubfolders), 6);
    }

    #[tokio::test]
    async fn test_teardown_saves_what_it_can_and_releases_handles() {
        let s = camera();
        let fh = s.create("/DCIM/100CAMFS/new.txt").await.unwrap();
        s.write(fh, 0, b"keep me").await.unwrap();
        s.device()
            .fail_next(DeviceOp::ReplaceContent, DeviceErrorKind::IoWrite);
        assert!(s.release(fh).await.is_err());
        assert_eq!(s.device().live_handles(), 1);

        let open = s.open("/DCIM/100CAMFS/IMG_0001.JPG", false).await.unwrap();
        assert_eq!(s.device().live_handles(), 2);

        s.teardown().await;
        assert_eq!(
            s.device().file_bytes("/DCIM/100CAMFS", "new.txt").unwrap(),
            b"keep me"
        );
        assert_eq!(s.device().live_handles(), 0);
        assert!(matches!(
            s.release(open).await.unwrap_err(),
            VfsError::BadHandle(_)
        ));
    }

    #[tokio::test]
    async fn test_create_below_a_folder_being_removed_is_busy() {
        let dev = MemoryDevice::new();
        dev.seed_folder("/DCIM/empty");
        let s = Session::new(SlowRemove(dev), options());
        s.getattr("/DCIM/empty").await.unwrap();

        let (removed, created) = tokio::join!(
            s.rmdir("/DCIM/empty"),
            s.create("/DCIM/empty/new.jpg")
        );
        removed.unwrap();
        assert_eq!(created.unwrap_err().errno(), libc::EBUSY);
        assert!(!s.device().0.has_folder("/DCIM/empty"));
        assert_eq!(s.device().0.live_handles(), 0);
        assert_eq!(s.getattr("/DCIM/empty").await.unwrap_err().errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn test_open_during_refused_removal_is_busy_then_works() {
        let dev = MemoryDevice::new();
        dev.seed_file("/DCIM/full", "a.jpg", b"jpeg");
        let s = Session::new(SlowRemove(dev), options());
        s.getattr("/DCIM/full/a.jpg").await.unwrap();

        let (removed, opened) = tokio::join!(
            s.rmdir("/DCIM/full"),
            s.open("/DCIM/full/a.jpg", false)
        );
        assert_eq!(removed.unwrap_err().errno(), libc::ENOTEMPTY);
        assert_eq!(opened.unwrap_err().errno(), libc::EBUSY);

        // The failed removal leaves the folder usable.
        let fh = s.open("/DCIM/full/a.jpg", false).await.unwrap();
        assert_eq!(s.read(fh, 0, 4).await.unwrap(), b"jpeg");
        s.release(fh).await.unwrap();
        let fh = s.create("/DCIM/full/b.jpg").await.unwrap();
        s.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_rmdir_while_one_is_in_flight_is_busy() {
        let dev = MemoryDevice::new();
        dev.seed_folder("/DCIM/empty");
        let s = Session::new(SlowRemove(dev), options());
        s.getattr("/DCIM/empty").await.unwrap();

        let (first, second) = tokio::join!(s.rmdir("/DCIM/empty"), s.rmdir("/DCIM/empty"));
        first.unwrap();
        assert_eq!(second.unwrap_err().errno(), libc::EBUSY);
        assert_eq!(s.device().0.calls(DeviceOp::RemoveFolder), 1);
    }
}
