//! Host directory acting as camera storage (implements `DeviceService`).
//!
//! Useful for running the filesystem without a camera attached. The file
//! content semantics match a camera: whole-file fetch, no in-place update.

use super::{Capacity, DeviceError, DeviceErrorKind, DeviceResult, DeviceService, FileInfo};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

pub struct LocalDirDevice {
    root: PathBuf,
}

#[derive(Debug)]
pub struct LocalHandle {
    path: PathBuf,
    data: Vec<u8>,
}

impl LocalDirDevice {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn folder_path(&self, op: &'static str, folder: &str) -> DeviceResult<PathBuf> {
        let mut out = self.root.clone();
        for seg in folder.split('/').filter(|s| !s.is_empty()) {
            out.push(checked_segment(op, seg)?);
        }
        Ok(out)
    }

    fn entry_path(&self, op: &'static str, folder: &str, name: &str) -> DeviceResult<PathBuf> {
        Ok(self.folder_path(op, folder)?.join(checked_segment(op, name)?))
    }
}

fn checked_segment<'a>(op: &'static str, seg: &'a str) -> DeviceResult<&'a str> {
    if seg == "." || seg == ".." || seg.contains('/') {
        return Err(DeviceError::new(DeviceErrorKind::BadParameters, op, seg));
    }
    Ok(seg)
}

#[async_trait]
impl DeviceService for LocalDirDevice {
    type Handle = LocalHandle;

    async fn list_subfolders(&self, folder: &str) -> DeviceResult<Vec<String>> {
        let path = self.folder_path("list_subfolders", folder)?;
        let io_err = |e| DeviceError::from_io("list_subfolders", folder, e);
        let mut rd = fs::read_dir(&path).await.map_err(io_err)?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(io_err)? {
            if entry.file_type().await.map_err(io_err)?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        debug!("localdir: {} subfolders in {folder}", out.len());
        Ok(out)
    }

    async fn list_files(&self, folder: &str) -> DeviceResult<Vec<FileInfo>> {
        let path = self.folder_path("list_files", folder)?;
        let io_err = |e| DeviceError::from_io("list_files", folder, e);
        let mut rd = fs::read_dir(&path).await.map_err(io_err)?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(io_err)? {
            let meta = entry.metadata().await.map_err(io_err)?;
            if !meta.is_file() {
                continue;
            }
            out.push(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                mtime: meta.modified().map_err(io_err)?,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("localdir: {} files in {folder}", out.len());
        Ok(out)
    }

    async fn create_folder(&self, parent: &str, name: &str) -> DeviceResult<()> {
        let path = self.entry_path("create_folder", parent, name)?;
        fs::create_dir(&path)
            .await
            .map_err(|e| DeviceError::from_io("create_folder", name, e))
    }

    async fn remove_folder(&self, parent: &str, name: &str) -> DeviceResult<()> {
        let path = self.entry_path("remove_folder", parent, name)?;
        fs::remove_dir(&path)
            .await
            .map_err(|e| DeviceError::from_io("remove_folder", name, e))
    }

    async fn fetch_file_content(&self, folder: &str, name: &str) -> DeviceResult<LocalHandle> {
        let path = self.entry_path("fetch_file_content", folder, name)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| DeviceError::from_io("fetch_file_content", name, e))?;
        debug!("localdir: fetched {} bytes from {}", data.len(), path.display());
        Ok(LocalHandle { path, data })
    }

    fn new_file_handle(&self, folder: &str, name: &str) -> LocalHandle {
        // A rejected name yields a path outside the root; replace_content refuses it.
        let path = self
            .entry_path("new_file_handle", folder, name)
            .unwrap_or_else(|_| PathBuf::from(name));
        LocalHandle {
            path,
            data: Vec::new(),
        }
    }

    async fn read_all(&self, handle: &LocalHandle) -> DeviceResult<Vec<u8>> {
        Ok(handle.data.clone())
    }

    async fn replace_content(&self, handle: &mut LocalHandle, data: Vec<u8>) -> DeviceResult<()> {
        let ctx = handle.path.display().to_string();
        if !handle.path.starts_with(&self.root) {
            return Err(DeviceError::new(
                DeviceErrorKind::BadParameters,
                "replace_content",
                ctx,
            ));
        }
        let io_err = |e| DeviceError::from_io("replace_content", ctx.clone(), e);
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&handle.path)
            .await
            .map_err(io_err)?;
        f.write_all(&data).await.map_err(io_err)?;
        f.flush().await.map_err(io_err)?;
        handle.data = data;
        Ok(())
    }

    async fn delete_file(&self, folder: &str, name: &str) -> DeviceResult<()> {
        let path = self.entry_path("delete_file", folder, name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| DeviceError::from_io("delete_file", name, e))
    }

    fn release(&self, handle: LocalHandle) {
        debug!("localdir: release {}", handle.path.display());
    }

    async fn storage_capacity(&self) -> DeviceResult<Capacity> {
        let st = nix::sys::statvfs::statvfs(&self.root).map_err(|e| {
            DeviceError::from_io(
                "storage_capacity",
                self.root.display().to_string(),
                std::io::Error::from(e),
            )
        })?;
        let frsize = st.fragment_size() as u64;
        Ok(Capacity {
            total_kb: st.blocks() as u64 * frsize / 1024,
            free_kb: st.blocks_available() as u64 * frsize / 1024,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localdir_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("DCIM/100CAMFS")).unwrap();
        std::fs::write(tmp.path().join("DCIM/100CAMFS/a.jpg"), b"jpeg").unwrap();
        let dev = LocalDirDevice::new(tmp.path());

        assert_eq!(dev.list_subfolders("/").await.unwrap(), vec!["DCIM"]);
        let files = dev.list_files("/DCIM/100CAMFS").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 4);

        let h = dev.fetch_file_content("/DCIM/100CAMFS", "a.jpg").await.unwrap();
        assert_eq!(dev.read_all(&h).await.unwrap(), b"jpeg");
        dev.release(h);

        dev.delete_file("/DCIM/100CAMFS", "a.jpg").await.unwrap();
        let mut h = dev.new_file_handle("/DCIM/100CAMFS", "a.jpg");
        dev.replace_content(&mut h, b"new".to_vec()).await.unwrap();
        assert_eq!(
            std::fs::read(tmp.path().join("DCIM/100CAMFS/a.jpg")).unwrap(),
            b"new"
        );
    }

    #[tokio::test]
    async fn test_localdir_errors_map_to_device_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = LocalDirDevice::new(tmp.path());

        let err = dev.delete_file("/", "missing").await.unwrap_err();
        assert!(err.kind.is_not_found());

        dev.create_folder("/", "d").await.unwrap();
        let err = dev.create_folder("/", "d").await.unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);

        let err = dev.list_files("/../etc").await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::BadParameters);

        let cap = dev.storage_capacity().await.unwrap();
        assert!(cap.total_kb >= cap.free_kb);
    }
}
