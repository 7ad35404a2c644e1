//! Lazy population of directory nodes from device listings.

use super::error::VfsResult;
use super::path;
use super::session::Session;
use crate::device::DeviceService;
use tracing::{debug, warn};

impl<D: DeviceService> Session<D> {
    /// Read the children of the directory at `segs` from the device, once.
    ///
    /// Populators are serialised, and the listed flag is checked again after
    /// the gate is taken, so a directory is listed at most once per unlisted
    /// period. Subfolders are committed as soon as they are known; files are
    /// committed together with the listed flag, so a failed file listing
    /// leaves the directory unlisted and the next access retries.
    pub(crate) async fn populate(&self, segs: &[&str]) -> VfsResult<()> {
        let _gate = self.populate_gate.lock().await;
        {
            let tree = self.tree.lock();
            Self::check_not_removing(&tree, segs)?;
            if tree.descend(segs).is_none_or(|dir| dir.is_listed()) {
                return Ok(());
            }
        }

        let folder = path::folder_of(segs);
        let subfolders = self.device.list_subfolders(&folder).await.inspect_err(|e| {
            warn!("listing folders of {folder} failed: {e}");
        })?;
        if let Some(dir) = self.tree.lock().descend_mut(segs) {
            for name in subfolders {
                dir.adopt_dir(name);
            }
        }

        let files = self.device.list_files(&folder).await.inspect_err(|e| {
            warn!("listing files of {folder} failed: {e}");
        })?;
        let mut tree = self.tree.lock();
        match tree.descend_mut(segs) {
            Some(dir) => {
                let count = files.len();
                for info in files {
                    dir.adopt_file(info);
                }
                dir.mark_listed();
                debug!("populated {folder}: {count} files");
            }
            None => debug!("{folder} went away while being listed"),
        }
        Ok(())
    }

    /// Populate the directory at `segs` unless it is listed already.
    pub(crate) async fn ensure_listed(&self, segs: &[&str]) -> VfsResult<()> {
        if self
            .tree
            .lock()
            .descend(segs)
            .is_some_and(|dir| dir.is_listed())
        {
            return Ok(());
        }
        self.populate(segs).await
    }
}
