//! Device error taxonomy and its mapping onto errno.
//!
//! Kinds mirror the result codes a PTP/gphoto2 camera stack reports. The
//! errno mapping is total: anything not named below becomes `EINVAL`.

use std::io;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceErrorKind {
    Generic,
    BadParameters,
    NoMemory,
    Library,
    UnknownPort,
    NotSupported,
    Timeout,
    Io,
    IoSupportedSerial,
    IoSupportedUsb,
    IoInit,
    IoRead,
    IoWrite,
    IoUpdate,
    IoSerialSpeed,
    IoUsbClearHalt,
    IoUsbFind,
    IoUsbClaim,
    IoLock,
    CameraBusy,
    FileNotFound,
    DirectoryNotFound,
    FileExists,
    DirectoryExists,
    DirectoryNotEmpty,
    PathNotAbsolute,
    CorruptedData,
    Cancel,
    ModelNotFound,
    CameraError,
    OsFailure,
    NoSpace,
    /// A result code this crate does not know about.
    Other(i32),
}

impl DeviceErrorKind {
    /// Decode a raw gphoto2 result code.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => Self::Generic,
            -2 => Self::BadParameters,
            -3 => Self::NoMemory,
            -4 => Self::Library,
            -5 => Self::UnknownPort,
            -6 => Self::NotSupported,
            -7 => Self::Io,
            -10 => Self::Timeout,
            -20 => Self::IoSupportedSerial,
            -21 => Self::IoSupportedUsb,
            -31 => Self::IoInit,
            -34 => Self::IoRead,
            -35 => Self::IoWrite,
            -37 => Self::IoUpdate,
            -41 => Self::IoSerialSpeed,
            -51 => Self::IoUsbClearHalt,
            -52 => Self::IoUsbFind,
            -53 => Self::IoUsbClaim,
            -60 => Self::IoLock,
            -102 => Self::CorruptedData,
            -103 => Self::FileExists,
            -105 => Self::ModelNotFound,
            -107 => Self::DirectoryNotFound,
            -108 => Self::FileNotFound,
            -109 => Self::DirectoryExists,
            -110 => Self::CameraBusy,
            -111 => Self::PathNotAbsolute,
            -112 => Self::Cancel,
            -113 => Self::CameraError,
            -114 => Self::OsFailure,
            -115 => Self::NoSpace,
            other => Self::Other(other),
        }
    }

    /// Positive errno value reported to the filesystem caller.
    pub fn errno(self) -> i32 {
        match self {
            Self::Generic => libc::EPROTO,
            Self::BadParameters => libc::EINVAL,
            Self::NoMemory => libc::ENOMEM,
            Self::Library => libc::ENOSYS,
            Self::UnknownPort => libc::ENXIO,
            Self::NotSupported => libc::EPROTONOSUPPORT,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Io
            | Self::IoSupportedSerial
            | Self::IoSupportedUsb
            | Self::IoInit
            | Self::IoRead
            | Self::IoWrite
            | Self::IoUpdate
            | Self::IoSerialSpeed
            | Self::IoUsbClearHalt
            | Self::IoUsbFind
            | Self::IoUsbClaim
            | Self::IoLock => libc::EIO,
            Self::CameraBusy => libc::EBUSY,
            Self::FileNotFound | Self::DirectoryNotFound => libc::ENOENT,
            Self::FileExists | Self::DirectoryExists => libc::EEXIST,
            Self::DirectoryNotEmpty => libc::ENOTEMPTY,
            Self::PathNotAbsolute => libc::ENOTDIR,
            Self::CorruptedData => libc::EIO,
            Self::Cancel => libc::ECANCELED,
            Self::ModelNotFound => libc::EPROTO,
            Self::CameraError => libc::EPERM,
            Self::OsFailure => libc::EPIPE,
            Self::NoSpace => libc::ENOSPC,
            Self::Other(_) => libc::EINVAL,
        }
    }

    pub fn is_not_found(self) -> bool {
        matches!(self, Self::FileNotFound | Self::DirectoryNotFound)
    }
}

#[derive(Debug, Error, Clone)]
#[error("device {op} failed ({kind:?}): {context}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub op: &'static str,
    pub context: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, op: &'static str, context: impl Into<String>) -> Self {
        Self {
            kind,
            op,
            context: context.into(),
        }
    }

    pub fn errno(&self) -> i32 {
        self.kind.errno()
    }

    /// Wrap a host io error raised while serving `op`.
    pub fn from_io(op: &'static str, context: impl Into<String>, err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => DeviceErrorKind::FileNotFound,
            io::ErrorKind::AlreadyExists => DeviceErrorKind::FileExists,
            io::ErrorKind::DirectoryNotEmpty => DeviceErrorKind::DirectoryNotEmpty,
            io::ErrorKind::PermissionDenied => DeviceErrorKind::CameraError,
            io::ErrorKind::TimedOut => DeviceErrorKind::Timeout,
            io::ErrorKind::StorageFull => DeviceErrorKind::NoSpace,
            io::ErrorKind::OutOfMemory => DeviceErrorKind::NoMemory,
            io::ErrorKind::InvalidInput => DeviceErrorKind::BadParameters,
            io::ErrorKind::Unsupported => DeviceErrorKind::NotSupported,
            io::ErrorKind::Interrupted => DeviceErrorKind::Cancel,
            io::ErrorKind::BrokenPipe => DeviceErrorKind::OsFailure,
            _ => DeviceErrorKind::Io,
        };
        Self::new(kind, op, format!("{}: {err}", context.into()))
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
