//! Path resolution over the cached tree.
//!
//! A walk only ever reads the tree. When it reaches a directory whose
//! children were never read, it stops and reports how deep it got; the
//! session then populates that directory and walks again. The tree lock is
//! never held across a device call.

use super::error::{VfsError, VfsResult};
use super::node::{DirNode, FileNode};
use super::path;
use super::session::Session;
use crate::device::DeviceService;
use std::sync::Arc;

pub enum Target<H> {
    Dir,
    File(Arc<FileNode<H>>),
}

pub(crate) enum Walk<H> {
    Found(Target<H>),
    Missing,
    /// The directory at this depth must be populated before going on.
    Unlisted(usize),
}

pub(crate) fn walk<H>(root: &DirNode<H>, segs: &[&str]) -> Walk<H> {
    let Some((last, parents)) = segs.split_last() else {
        return Walk::Found(Target::Dir);
    };
    let mut cur = root;
    for (depth, seg) in parents.iter().enumerate() {
        if !cur.is_listed() {
            return Walk::Unlisted(depth);
        }
        match cur.dir(seg) {
            Some(next) => cur = next,
            None => return Walk::Missing,
        }
    }
    if !cur.is_listed() {
        return Walk::Unlisted(parents.len());
    }
    if cur.dir(last).is_some() {
        Walk::Found(Target::Dir)
    } else if let Some(file) = cur.file(last) {
        Walk::Found(Target::File(file.clone()))
    } else {
        Walk::Missing
    }
}

impl<D: DeviceService> Session<D> {
    /// Find the node at `segs`, populating directories on the way down.
    /// `Ok(None)` means the path does not exist on the device either.
    pub(crate) async fn resolve(&self, segs: &[&str]) -> VfsResult<Option<Target<D::Handle>>> {
        loop {
            let step = walk(&*self.tree.lock(), segs);
            match step {
                Walk::Found(target) => return Ok(Some(target)),
                Walk::Missing => return Ok(None),
                Walk::Unlisted(depth) => self.populate(&segs[..depth]).await?,
            }
        }
    }

    pub(crate) async fn expect_dir(&self, segs: &[&str]) -> VfsResult<()> {
        match self.resolve(segs).await? {
            Some(Target::Dir) => Ok(()),
            Some(Target::File(_)) => Err(VfsError::NotADirectory(path::folder_of(segs))),
            None => Err(VfsError::NotFound(path::folder_of(segs))),
        }
    }

    pub(crate) async fn expect_file(&self, segs: &[&str]) -> VfsResult<Arc<FileNode<D::Handle>>> {
        match self.resolve(segs).await? {
            Some(Target::File(file)) => Ok(file),
            Some(Target::Dir) => Err(VfsError::IsADirectory(path::folder_of(segs))),
            None => Err(VfsError::NotFound(path::folder_of(segs))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileInfo;
    use std::time::UNIX_EPOCH;

    fn tree() -> DirNode<()> {
        let mut root = DirNode::new_listed("");
        let mut dcim = DirNode::new_listed("DCIM");
        dcim.adopt_dir("100CAMFS".into());
        dcim.adopt_file(FileInfo {
            name: "a.jpg".into(),
            size: 1,
            mtime: UNIX_EPOCH,
        });
        root.insert_dir(dcim).unwrap();
        root
    }

    #[test]
    fn test_walk_outcomes() {
        let root = tree();
        assert!(matches!(walk(&root, &[]), Walk::Found(Target::Dir)));
        assert!(matches!(walk(&root, &["DCIM"]), Walk::Found(Target::Dir)));
        assert!(matches!(
            walk(&root, &["DCIM", "a.jpg"]),
            Walk::Found(Target::File(_))
        ));
        assert!(matches!(walk(&root, &["DCIM", "b.jpg"]), Walk::Missing));
        assert!(matches!(walk(&root, &["nope", "x"]), Walk::Missing));
        // A file in the middle of a path does not resolve.
        assert!(matches!(walk(&root, &["DCIM", "a.jpg", "x"]), Walk::Missing));
        // The unlisted directory itself resolves; its children need a listing.
        assert!(matches!(
            walk(&root, &["DCIM", "100CAMFS"]),
            Walk::Found(Target::Dir)
        ));
        assert!(matches!(
            walk(&root, &["DCIM", "100CAMFS", "x.jpg"]),
            Walk::Unlisted(2)
        ));
    }

    #[test]
    fn test_walk_stops_at_unlisted_root() {
        let root: DirNode<()> = DirNode::new("");
        assert!(matches!(walk(&root, &["DCIM"]), Walk::Unlisted(0)));
    }
}
