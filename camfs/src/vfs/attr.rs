//! Attribute and listing types handed to the FUSE adapter.

use crate::device::Capacity;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

/// Owner reported for every entry. Permissions are fixed and never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    /// Ids of the mounting process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: FileType,
    pub size: u64,
    pub mtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileAttr {
    pub fn dir(owner: Identity) -> Self {
        Self {
            kind: FileType::Dir,
            size: 0,
            mtime: UNIX_EPOCH,
            perm: 0o755,
            nlink: 2,
            uid: owner.uid,
            gid: owner.gid,
        }
    }

    pub fn file(owner: Identity, size: u64, mtime: SystemTime) -> Self {
        Self {
            kind: FileType::File,
            size,
            mtime,
            perm: 0o644,
            nlink: 1,
            uid: owner.uid,
            gid: owner.gid,
        }
    }

    /// 512-byte blocks, rounded up.
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub attr: FileAttr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

impl From<Capacity> for StatFs {
    fn from(cap: Capacity) -> Self {
        Self {
            blocks: cap.total_kb,
            bfree: cap.free_kb,
            bavail: cap.free_kb,
            // The camera does not count inodes.
            files: u64::MAX,
            ffree: u64::MAX,
            bsize: 1024,
            namelen: 255,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_round_up() {
        let owner = Identity { uid: 1, gid: 2 };
        assert_eq!(FileAttr::file(owner, 0, UNIX_EPOCH).blocks(), 0);
        assert_eq!(FileAttr::file(owner, 1, UNIX_EPOCH).blocks(), 1);
        assert_eq!(FileAttr::file(owner, 1024, UNIX_EPOCH).blocks(), 2);
        assert_eq!(FileAttr::file(owner, 1025, UNIX_EPOCH).blocks(), 3);
    }

    #[test]
    fn test_statfs_from_capacity() {
        let st = StatFs::from(Capacity {
            total_kb: 1000,
            free_kb: 250,
        });
        assert_eq!((st.blocks, st.bfree, st.bavail), (1000, 250, 250));
        assert_eq!(st.bsize, 1024);
    }
}
