//! In-memory camera storage (implements `DeviceService`).
//!
//! Keeps per-operation call counters and supports one-shot fault injection
//! so that callers can check how often they reach the device and how they
//! behave when it fails.

use super::{Capacity, DeviceError, DeviceErrorKind, DeviceResult, DeviceService, FileInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    ListSubfolders,
    ListFiles,
    CreateFolder,
    RemoveFolder,
    FetchFile,
    ReadAll,
    ReplaceContent,
    DeleteFile,
    StorageCapacity,
}

#[derive(Default)]
struct MemFolder {
    folders: BTreeMap<String, MemFolder>,
    files: BTreeMap<String, MemFile>,
}

#[derive(Clone)]
struct MemFile {
    data: Vec<u8>,
    mtime: SystemTime,
}

impl MemFolder {
    fn walk(&self, path: &str) -> Option<&MemFolder> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |dir, seg| dir.folders.get(seg))
    }

    fn walk_mut(&mut self, path: &str) -> Option<&mut MemFolder> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |dir, seg| dir.folders.get_mut(seg))
    }

    fn bytes_used(&self) -> u64 {
        let files: u64 = self.files.values().map(|f| f.data.len() as u64).sum();
        files + self.folders.values().map(MemFolder::bytes_used).sum::<u64>()
    }
}

/// Device side file representation: where the file lives plus its bytes.
#[derive(Debug)]
pub struct MemoryHandle {
    folder: String,
    name: String,
    data: Vec<u8>,
}

pub struct MemoryDevice {
    root: Mutex<MemFolder>,
    total_kb: u64,
    calls: Mutex<HashMap<DeviceOp, usize>>,
    faults: Mutex<HashMap<DeviceOp, DeviceErrorKind>>,
    live_handles: AtomicUsize,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::with_capacity_kb(1024 * 1024)
    }

    pub fn with_capacity_kb(total_kb: u64) -> Self {
        Self {
            root: Mutex::new(MemFolder::default()),
            total_kb,
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            live_handles: AtomicUsize::new(0),
        }
    }

    /// Create `path` and any missing ancestors.
    pub fn seed_folder(&self, path: &str) {
        let mut root = self.root.lock();
        let mut dir = &mut *root;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            dir = dir.folders.entry(seg.to_string()).or_default();
        }
    }

    pub fn seed_file(&self, folder: &str, name: &str, data: &[u8]) {
        self.seed_folder(folder);
        let mut root = self.root.lock();
        if let Some(dir) = root.walk_mut(folder) {
            dir.files.insert(
                name.to_string(),
                MemFile {
                    data: data.to_vec(),
                    mtime: SystemTime::now(),
                },
            );
        }
    }

    pub fn file_bytes(&self, folder: &str, name: &str) -> Option<Vec<u8>> {
        let root = self.root.lock();
        root.walk(folder)?.files.get(name).map(|f| f.data.clone())
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.root.lock().walk(path).is_some()
    }

    /// Number of times `op` reached the device, failed attempts included.
    pub fn calls(&self, op: DeviceOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Make the next call of `op` fail with `kind`.
    pub fn fail_next(&self, op: DeviceOp, kind: DeviceErrorKind) {
        self.faults.lock().insert(op, kind);
    }

    /// Handles fetched or created and not yet released.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    fn enter(&self, op: DeviceOp, op_name: &'static str, context: &str) -> DeviceResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        debug!("memory device: {op_name} {context}");
        match self.faults.lock().remove(&op) {
            Some(kind) => Err(DeviceError::new(kind, op_name, format!("injected fault at {context}"))),
            None => Ok(()),
        }
    }
}

fn folder_missing(op: &'static str, folder: &str) -> DeviceError {
    DeviceError::new(DeviceErrorKind::DirectoryNotFound, op, folder)
}

#[async_trait]
impl DeviceService for MemoryDevice {
    type Handle = MemoryHandle;

    async fn list_subfolders(&self, folder: &str) -> DeviceResult<Vec<String>> {
        self.enter(DeviceOp::ListSubfolders, "list_subfolders", folder)?;
        let root = self.root.lock();
        let dir = root
            .walk(folder)
            .ok_or_else(|| folder_missing("list_subfolders", folder))?;
        Ok(dir.folders.keys().cloned().collect())
    }

    async fn list_files(&self, folder: &str) -> DeviceResult<Vec<FileInfo>> {
        self.enter(DeviceOp::ListFiles, "list_files", folder)?;
        let root = self.root.lock();
        let dir = root
            .walk(folder)
            .ok_or_else(|| folder_missing("list_files", folder))?;
        Ok(dir
            .files
            .iter()
            .map(|(name, f)| FileInfo {
                name: name.clone(),
                size: f.data.len() as u64,
                mtime: f.mtime,
            })
            .collect())
    }

    async fn create_folder(&self, parent: &str, name: &str) -> DeviceResult<()> {
        self.enter(DeviceOp::CreateFolder, "create_folder", name)?;
        let mut root = self.root.lock();
        let dir = root
            .walk_mut(parent)
            .ok_or_else(|| folder_missing("create_folder", parent))?;
        if dir.folders.contains_key(name) {
            return Err(DeviceError::new(
                DeviceErrorKind::DirectoryExists,
                "create_folder",
                name,
            ));
        }
        dir.folders.insert(name.to_string(), MemFolder::default());
        Ok(())
    }

    async fn remove_folder(&self, parent: &str, name: &str) -> DeviceResult<()> {
        self.enter(DeviceOp::RemoveFolder, "remove_folder", name)?;
        let mut root = self.root.lock();
        let dir = root
            .walk_mut(parent)
            .ok_or_else(|| folder_missing("remove_folder", parent))?;
        match dir.folders.get(name) {
            None => Err(folder_missing("remove_folder", name)),
            Some(child) if !child.files.is_empty() || !child.folders.is_empty() => Err(
                DeviceError::new(DeviceErrorKind::DirectoryNotEmpty, "remove_folder", name),
            ),
            Some(_) => {
                dir.folders.remove(name);
                Ok(())
            }
        }
    }

    async fn fetch_file_content(&self, folder: &str, name: &str) -> DeviceResult<MemoryHandle> {
        self.enter(DeviceOp::FetchFile, "fetch_file_content", name)?;
        let root = self.root.lock();
        let file = root
            .walk(folder)
            .and_then(|dir| dir.files.get(name))
            .ok_or_else(|| {
                DeviceError::new(DeviceErrorKind::FileNotFound, "fetch_file_content", name)
            })?;
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryHandle {
            folder: folder.to_string(),
            name: name.to_string(),
            data: file.data.clone(),
        })
    }

    fn new_file_handle(&self, folder: &str, name: &str) -> MemoryHandle {
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        MemoryHandle {
            folder: folder.to_string(),
            name: name.to_string(),
            data: Vec::new(),
        }
    }

    async fn read_all(&self, handle: &MemoryHandle) -> DeviceResult<Vec<u8>> {
        self.enter(DeviceOp::ReadAll, "read_all", &handle.name)?;
        Ok(handle.data.clone())
    }

    async fn replace_content(&self, handle: &mut MemoryHandle, data: Vec<u8>) -> DeviceResult<()> {
        self.enter(DeviceOp::ReplaceContent, "replace_content", &handle.name)?;
        let mut root = self.root.lock();
        let used_kb = root.bytes_used().div_ceil(1024);
        if used_kb + (data.len() as u64).div_ceil(1024) > self.total_kb {
            return Err(DeviceError::new(
                DeviceErrorKind::NoSpace,
                "replace_content",
                handle.name.clone(),
            ));
        }
        let dir = root
            .walk_mut(&handle.folder)
            .ok_or_else(|| folder_missing("replace_content", &handle.folder))?;
        if dir.files.contains_key(&handle.name) {
            return Err(DeviceError::new(
                DeviceErrorKind::FileExists,
                "replace_content",
                handle.name.clone(),
            ));
        }
        dir.files.insert(
            handle.name.clone(),
            MemFile {
                data: data.clone(),
                mtime: SystemTime::now(),
            },
        );
        handle.data = data;
        Ok(())
    }

    async fn delete_file(&self, folder: &str, name: &str) -> DeviceResult<()> {
        self.enter(DeviceOp::DeleteFile, "delete_file", name)?;
        let mut root = self.root.lock();
        root.walk_mut(folder)
            .and_then(|dir| dir.files.remove(name))
            .map(|_| ())
            .ok_or_else(|| DeviceError::new(DeviceErrorKind::FileNotFound, "delete_file", name))
    }

    fn release(&self, handle: MemoryHandle) {
        debug!("memory device: release {}/{}", handle.folder, handle.name);
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
    }

    async fn storage_capacity(&self) -> DeviceResult<Capacity> {
        self.enter(DeviceOp::StorageCapacity, "storage_capacity", "")?;
        let used_kb = self.root.lock().bytes_used().div_ceil(1024);
        Ok(Capacity {
            total_kb: self.total_kb,
            free_kb: self.total_kb.saturating_sub(used_kb),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_and_counters() {
        let dev = MemoryDevice::new();
        dev.seed_folder("/DCIM/100CANON");
        dev.seed_file("/DCIM/100CANON", "IMG_0001.JPG", b"jpeg");

        assert_eq!(dev.list_subfolders("/").await.unwrap(), vec!["DCIM"]);
        let files = dev.list_files("/DCIM/100CANON").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "IMG_0001.JPG");
        assert_eq!(files[0].size, 4);
        assert_eq!(dev.calls(DeviceOp::ListSubfolders), 1);
        assert_eq!(dev.calls(DeviceOp::ListFiles), 1);

        let err = dev.list_files("/nope").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let dev = MemoryDevice::new();
        dev.fail_next(DeviceOp::ListSubfolders, DeviceErrorKind::CameraBusy);
        let err = dev.list_subfolders("/").await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::CameraBusy);
        assert!(dev.list_subfolders("/").await.is_ok());
        assert_eq!(dev.calls(DeviceOp::ListSubfolders), 2);
    }

    #[tokio::test]
    async fn test_store_requires_prior_delete() {
        let dev = MemoryDevice::new();
        dev.seed_file("/", "a.txt", b"old");

        let mut h = dev.fetch_file_content("/", "a.txt").await.unwrap();
        assert_eq!(dev.read_all(&h).await.unwrap(), b"old");
        let err = dev.replace_content(&mut h, b"new".to_vec()).await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::FileExists);

        dev.delete_file("/", "a.txt").await.unwrap();
        dev.replace_content(&mut h, b"new".to_vec()).await.unwrap();
        assert_eq!(dev.file_bytes("/", "a.txt").unwrap(), b"new");

        dev.release(h);
        assert_eq!(dev.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_remove_folder_refuses_non_empty() {
        let dev = MemoryDevice::new();
        dev.seed_file("/DCIM", "x.jpg", b"x");
        let err = dev.remove_folder("/", "DCIM").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);
        dev.delete_file("/DCIM", "x.jpg").await.unwrap();
        dev.remove_folder("/", "DCIM").await.unwrap();
        assert!(!dev.has_folder("/DCIM"));
    }

    #[tokio::test]
    async fn test_capacity_tracks_usage() {
        let dev = MemoryDevice::with_capacity_kb(10);
        dev.seed_file("/", "big", &vec![0u8; 4096]);
        let cap = dev.storage_capacity().await.unwrap();
        assert_eq!(cap.total_kb, 10);
        assert_eq!(cap.free_kb, 6);

        let mut h = dev.new_file_handle("/", "huge");
        let err = dev.replace_content(&mut h, vec![0u8; 8192]).await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOSPC);
        dev.release(h);
    }
}
