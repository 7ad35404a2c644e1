//! Error type returned by every cache operation.

use crate::device::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("file would grow to {size} bytes")]
    TooLarge { size: u64 },

    #[error("unknown file handle {0}")]
    BadHandle(u64),

    #[error("file handle {0} is not open for writing")]
    ReadOnlyHandle(u64),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl VfsError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::Busy(_) => libc::EBUSY,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::TooLarge { .. } => libc::EFBIG,
            Self::BadHandle(_) | Self::ReadOnlyHandle(_) => libc::EBADF,
            Self::Device(e) => e.errno(),
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;
