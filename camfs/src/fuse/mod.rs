//! FUSE adapter and request handling
//!
//! Translates kernel requests into path based session operations:
//! - `inode`: maps the kernel's inode numbers to cache paths.
//! - `mount`: mounts a `CamFs` through rfuse3, privileged or via fusermount3.
//! - The `Filesystem` impl below, plus helpers converting session attributes
//!   and errors into their FUSE representations.
pub mod inode;
pub mod mount;

use crate::device::DeviceService;
use crate::vfs::path::join;
use crate::vfs::{FileAttr, FileType, Session, VfsError};
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use inode::InodeTable;
use rfuse3::Errno;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 1024 * 1024;

impl From<VfsError> for Errno {
    fn from(err: VfsError) -> Self {
        debug!("request failed: {err}");
        err.errno().into()
    }
}

/// The cache as seen by the kernel.
pub struct CamFs<D: DeviceService> {
    session: Arc<Session<D>>,
    inodes: InodeTable,
}

impl<D: DeviceService> CamFs<D> {
    pub fn new(session: Arc<Session<D>>) -> Self {
        Self {
            session,
            inodes: InodeTable::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session<D>> {
        &self.session
    }

    fn path(&self, ino: u64) -> FuseResult<String> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    /// Path of `name` under `parent`. Names must be UTF-8.
    fn child(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        self.inodes
            .child_path(parent, name)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn entry(&self, path: &str, attr: &FileAttr) -> ReplyEntry {
        ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(self.inodes.ino_of(path), attr),
            generation: 0,
        }
    }
}

impl<D: DeviceService> Filesystem for CamFs<D> {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        info!("unmounting, writing back cached changes");
        self.session.teardown().await;
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        let attr = self.session.getattr(&path).await?;
        Ok(self.entry(&path, &attr))
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        let attr = self.session.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr),
        })
    }

    // Only the size is stored; mode, owner and times are fixed.
    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        if let Some(size) = set_attr.size {
            self.session.truncate(&path, fh, size).await?;
        }
        let attr = self.session.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr),
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let writeable = (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY;
        let fh = self.session.open(&path, writeable).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let attr = self.session.getattr(&path).await?;
        if attr.kind != FileType::Dir {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self.session.read(fh, offset, size).await?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = self.session.write(fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path(ino)?;
        let entries = self.session.readdir(&path).await?;
        let parent = self.inodes.parent_of(ino);

        let all: Vec<DirectoryEntry> = entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| DirectoryEntry {
                inode: match e.name.as_str() {
                    "." => ino,
                    ".." => parent,
                    name => self.inodes.ino_of(&join(&path, name)),
                },
                kind: to_fuse_kind(e.attr.kind),
                name: OsString::from(e.name),
                offset: i as i64 + 1,
            })
            .collect();

        // `offset` is that of the last entry the kernel already has.
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let rest: Vec<_> = all.into_iter().skip(start).collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(rest.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path(ino)?;
        let entries = self.session.readdir(&path).await?;
        let parent = self.inodes.parent_of(ino);

        let all: Vec<DirectoryEntryPlus> = entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| {
                let inode = match e.name.as_str() {
                    "." => ino,
                    ".." => parent,
                    name => self.inodes.ino_of(&join(&path, name)),
                };
                DirectoryEntryPlus {
                    inode,
                    generation: 0,
                    kind: to_fuse_kind(e.attr.kind),
                    attr: to_fuse_attr(inode, &e.attr),
                    name: OsString::from(e.name),
                    offset: i as i64 + 1,
                    entry_ttl: TTL,
                    attr_ttl: TTL,
                }
            })
            .collect();

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let rest: Vec<_> = all.into_iter().skip(start).collect();
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(rest.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let st = self.session.statfs().await?;
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.bsize,
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        let attr = self.session.mkdir(&path).await?;
        Ok(self.entry(&path, &attr))
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child(parent, name)?;
        let fh = self.session.create(&path).await?;
        let attr = self.session.getattr(&path).await?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: to_fuse_attr(self.inodes.ino_of(&path), &attr),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.session.unlink(&path).await?;
        self.inodes.forget(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.session.rmdir(&path).await?;
        self.inodes.forget_tree(&path);
        Ok(())
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(self.session.release(fh).await?)
    }

    // Changes reach the device on release only.
    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(self.session.flush(fh).await?)
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(self.session.flush(fh).await?)
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn to_fuse_kind(kind: FileType) -> FuseFileType {
    match kind {
        FileType::Dir => FuseFileType::Directory,
        FileType::File => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, attr: &FileAttr) -> rfuse3::raw::reply::FileAttr {
    let mtime = Timestamp::from(attr.mtime);
    rfuse3::raw::reply::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks(),
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: to_fuse_kind(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 512,
    }
}

#[cfg(test)]
mod tests {
    use super::inode::ROOT_INO;
    use super::*;
    use crate::device::MemoryDevice;
    use crate::vfs::{Identity, SessionOptions};
    use std::os::unix::ffi::OsStrExt;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_child_names_must_be_utf8() {
        let session = Arc::new(Session::new(MemoryDevice::new(), SessionOptions::default()));
        let fs = CamFs::new(session);
        assert_eq!(
            fs.child(ROOT_INO, OsStr::new("DCIM")).ok().as_deref(),
            Some("/DCIM")
        );
        assert!(fs.child(ROOT_INO, OsStr::from_bytes(b"IMG_\xff.JPG")).is_err());
        assert!(fs.child(999, OsStr::new("DCIM")).is_err());
    }

    #[test]
    fn test_attr_conversion() {
        let owner = Identity { uid: 7, gid: 8 };
        let attr = to_fuse_attr(5, &FileAttr::file(owner, 1000, UNIX_EPOCH));
        assert_eq!(attr.ino, 5);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.perm, 0o644);
        assert_eq!((attr.uid, attr.gid, attr.nlink), (7, 8, 1));
        assert!(matches!(attr.kind, FuseFileType::RegularFile));

        let dir = to_fuse_attr(ROOT_INO, &FileAttr::dir(owner));
        assert_eq!(dir.perm, 0o755);
        assert_eq!(dir.nlink, 2);
        assert!(matches!(dir.kind, FuseFileType::Directory));
    }
}
