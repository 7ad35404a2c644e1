//! File buffers and write-back.
//!
//! A file's content is fetched from the device as a whole on first read or
//! write, edited in memory, and pushed back as a whole when a handle is
//! released. The device has no in-place update, so a push deletes the old
//! file and stores the new bytes.

use super::error::{VfsError, VfsResult};
use super::handles::OpenFile;
use super::node::{Content, FileNode, FileState};
use super::path;
use super::session::Session;
use crate::device::DeviceService;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, warn};

impl<D: DeviceService> Session<D> {
    /// Create an empty file and open it for writing. Nothing reaches the
    /// device until the handle is released.
    pub async fn create(&self, path: &str) -> VfsResult<u64> {
        let segs = path::segments(path);
        let Some((name, parent)) = segs.split_last() else {
            return Err(VfsError::AlreadyExists("/".into()));
        };
        if !path::is_valid_name(name) {
            return Err(VfsError::InvalidArgument((*name).to_string()));
        }
        self.expect_dir(parent).await?;
        self.ensure_listed(parent).await?;

        let folder = path::folder_of(parent);
        let file = {
            let mut tree = self.tree.lock();
            Self::check_not_removing(&tree, parent)?;
            let dir = tree
                .descend_mut(parent)
                .ok_or_else(|| VfsError::NotFound(folder.clone()))?;
            if dir.contains(name) {
                return Err(VfsError::AlreadyExists(path::folder_of(&segs)));
            }
            let file = FileNode::created(name, self.device.new_file_handle(&folder, name));
            dir.insert_file(file.clone())?;
            file
        };
        let fh = self.handles.insert(OpenFile {
            file,
            folder,
            writeable: true,
        });
        debug!("created {} as fh {fh}", path::folder_of(&segs));
        Ok(fh)
    }

    pub async fn open(&self, path: &str, writeable: bool) -> VfsResult<u64> {
        let segs = path::segments(path);
        let Some((_, parent)) = segs.split_last() else {
            return Err(VfsError::IsADirectory("/".into()));
        };
        let folder = path::folder_of(parent);
        loop {
            let file = self.expect_file(&segs).await?;
            let mut st = file.lock().await;
            if st.detached || !self.still_attached(parent, &file)? {
                // Removed from the tree while we waited; look again.
                continue;
            }
            if st.handle.is_none() {
                st.handle = Some(self.device.fetch_file_content(&folder, file.name()).await?);
            }
            file.acquire(&mut st);
            drop(st);
            let fh = self.handles.insert(OpenFile {
                file,
                folder,
                writeable,
            });
            return Ok(fh);
        }
    }

    /// Whether `file` is still the node at its path. Fails with busy while
    /// a folder on the path is being removed.
    fn still_attached(&self, parent: &[&str], file: &Arc<FileNode<D::Handle>>) -> VfsResult<bool> {
        let tree = self.tree.lock();
        Self::check_not_removing(&tree, parent)?;
        Ok(tree
            .descend(parent)
            .and_then(|dir| dir.file(file.name()))
            .is_some_and(|cached| Arc::ptr_eq(cached, file)))
    }

    /// Bytes in `[offset, offset + size)`, clipped to the end of the file.
    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        let of = self.handles.get(fh).ok_or(VfsError::BadHandle(fh))?;
        let mut st = of.file.lock().await;
        self.load(&mut st, of.file.name()).await?;
        let buf = st.content.bytes().unwrap_or_default();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(buf.len());
        let end = start.saturating_add(size as usize).min(buf.len());
        Ok(buf[start..end].to_vec())
    }

    /// Writes past the end of the file fill the gap with zeros.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let of = self.handles.get(fh).ok_or(VfsError::BadHandle(fh))?;
        if !of.writeable {
            return Err(VfsError::ReadOnlyHandle(fh));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = self.checked_size(offset.saturating_add(data.len() as u64))?;
        let start = end - data.len();

        let mut st = of.file.lock().await;
        self.load(&mut st, of.file.name()).await?;
        let state = &mut *st;
        let buf = dirty_buffer(&mut state.content, of.file.name());
        grow(buf, end)?;
        buf[start..end].copy_from_slice(data);
        state.size = buf.len() as u64;
        state.mtime = SystemTime::now();
        Ok(data.len() as u32)
    }

    /// Nothing to do until release; only checks the handle.
    pub async fn flush(&self, fh: u64) -> VfsResult<()> {
        self.handles
            .get(fh)
            .map(|_| ())
            .ok_or(VfsError::BadHandle(fh))
    }

    /// Close a handle. Dirty content is written back; when the last handle
    /// goes, the buffer and the device handle are dropped.
    ///
    /// A failed write-back still closes the handle but leaves the content
    /// dirty and keeps the device handle, so the next release retries.
    pub async fn release(&self, fh: u64) -> VfsResult<()> {
        let of = self.handles.remove(fh).ok_or(VfsError::BadHandle(fh))?;
        let mut st = of.file.lock().await;
        let remaining = of.file.release(&mut st);
        if st.content.is_dirty() {
            self.write_back(&mut st, &of.folder, of.file.name()).await?;
        }
        if remaining == 0 {
            st.content = Content::Cold;
            if let Some(handle) = st.handle.take() {
                self.device.release(handle);
            }
        }
        Ok(())
    }

    /// Resize to `size`, zero-filling growth. Without a handle the file is
    /// opened for the duration of the call, so the change is written back
    /// right away.
    pub async fn truncate(&self, path: &str, fh: Option<u64>, size: u64) -> VfsResult<()> {
        if let Some(fh) = fh {
            return self.truncate_handle(fh, size).await;
        }
        let fh = self.open(path, true).await?;
        let resized = self.truncate_handle(fh, size).await;
        let closed = self.release(fh).await;
        resized.and(closed)
    }

    async fn truncate_handle(&self, fh: u64, size: u64) -> VfsResult<()> {
        let of = self.handles.get(fh).ok_or(VfsError::BadHandle(fh))?;
        if !of.writeable {
            return Err(VfsError::ReadOnlyHandle(fh));
        }
        let len = self.checked_size(size)?;

        let mut st = of.file.lock().await;
        if len == 0 && matches!(st.content, Content::Cold) {
            // No need to fetch bytes that are about to be thrown away.
            st.content = Content::Dirty(Vec::new());
        } else {
            self.load(&mut st, of.file.name()).await?;
        }
        let state = &mut *st;
        let buf = dirty_buffer(&mut state.content, of.file.name());
        if len > buf.len() {
            grow(buf, len)?;
        } else {
            buf.truncate(len);
        }
        state.size = size;
        state.mtime = SystemTime::now();
        Ok(())
    }

    /// Delete a closed file from the device and the tree. A file that is
    /// already gone from the device is simply forgotten.
    pub async fn unlink(&self, path: &str) -> VfsResult<()> {
        let segs = path::segments(path);
        let Some((name, parent)) = segs.split_last() else {
            return Err(VfsError::IsADirectory("/".into()));
        };
        let full = path::folder_of(&segs);
        let folder = path::folder_of(parent);
        let file = self.expect_file(&segs).await?;

        let mut st = file.lock().await;
        if st.detached {
            return Err(VfsError::NotFound(full));
        }
        if file.open_count() > 0 {
            return Err(VfsError::Busy(full));
        }
        match self.device.delete_file(&folder, name).await {
            Ok(()) => {}
            Err(e) if e.kind.is_not_found() => debug!("{full} was already gone from the device"),
            Err(e) => return Err(e.into()),
        }
        self.capacity.invalidate();

        st.detached = true;
        if st.content.is_dirty() {
            warn!("discarding unsaved changes to deleted file {full}");
        }
        st.content = Content::Cold;
        if let Some(handle) = st.handle.take() {
            self.device.release(handle);
        }
        let mut tree = self.tree.lock();
        if let Some(dir) = tree.descend_mut(parent) {
            if dir
                .file(name)
                .is_some_and(|cached| Arc::ptr_eq(cached, &file))
            {
                dir.remove_file(name)?;
            }
        }
        Ok(())
    }

    /// Push dirty content to the device. On success the content is clean;
    /// on failure it stays dirty and nothing else changes.
    pub(super) async fn write_back(
        &self,
        st: &mut FileState<D::Handle>,
        folder: &str,
        name: &str,
    ) -> VfsResult<()> {
        let Some(data) = st.content.bytes().map(<[u8]>::to_vec) else {
            return Ok(());
        };
        let full = path::join(folder, name);
        let Some(handle) = st.handle.as_mut() else {
            error!("dirty file {full} has no device handle");
            panic!("dirty file {full} has no device handle");
        };
        match self.device.delete_file(folder, name).await {
            Ok(()) => {}
            Err(e) if e.kind.is_not_found() => {}
            Err(e) => warn!("could not remove old copy of {full}: {e}"),
        }
        let len = data.len();
        if let Err(e) = self.device.replace_content(handle, data).await {
            warn!("write-back of {full} failed, keeping it dirty: {e}");
            return Err(e.into());
        }
        self.capacity.invalidate();
        st.content.settle(true);
        st.size = len as u64;
        debug!("wrote back {full} ({len} bytes)");
        Ok(())
    }

    /// Make the content resident, fetching it through the open handle.
    async fn load(&self, st: &mut FileState<D::Handle>, name: &str) -> VfsResult<()> {
        if !matches!(st.content, Content::Cold) {
            return Ok(());
        }
        let Some(handle) = st.handle.as_ref() else {
            error!("open file {name} has no device handle");
            panic!("open file {name} has no device handle");
        };
        let data = self.device.read_all(handle).await?;
        st.size = data.len() as u64;
        st.content = Content::Clean(data);
        Ok(())
    }

    fn checked_size(&self, size: u64) -> VfsResult<usize> {
        if size > self.max_file_size {
            return Err(VfsError::TooLarge { size });
        }
        usize::try_from(size).map_err(|_| VfsError::TooLarge { size })
    }
}

fn dirty_buffer<'a>(content: &'a mut Content, name: &str) -> &'a mut Vec<u8> {
    match content.make_dirty() {
        Some(buf) => buf,
        None => {
            error!("{name} is not resident after load");
            panic!("{name} is not resident after load");
        }
    }
}

/// Extend with zeros up to `len`, failing instead of aborting when the
/// allocation is refused.
fn grow(buf: &mut Vec<u8>, len: usize) -> VfsResult<()> {
    if len > buf.len() {
        buf.try_reserve(len - buf.len())
            .map_err(|_| VfsError::TooLarge { size: len as u64 })?;
        buf.resize(len, 0);
    }
    Ok(())
}
