//! Device service adapters
//!
//! Responsibilities:
//! - Define the `DeviceService` contract the filesystem cache consumes: folder
//!   and file enumeration, whole-file fetch and store, folder create/remove,
//!   file delete and storage capacity.
//! - Map every device failure onto a `DeviceErrorKind`, which in turn has a
//!   total mapping onto errno.
//!
//! Every call is a full round trip to the device. Callers are expected to
//! cache; nothing in this layer does.
//!
//! Submodules:
//! - `memory`: in-memory camera used by tests and `--demo` mounts
//! - `localdir`: a host directory standing in for camera storage
pub mod error;
pub mod localdir;
pub mod memory;

use async_trait::async_trait;
use std::time::SystemTime;

pub use error::{DeviceError, DeviceErrorKind, DeviceResult};
pub use localdir::LocalDirDevice;
pub use memory::{DeviceOp, MemoryDevice};

/// Metadata of a file as the device reports it in a folder listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Storage capacity in KiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacity {
    pub total_kb: u64,
    pub free_kb: u64,
}

/// Protocol-level access to the storage owning device.
///
/// Folder arguments are absolute, `/`-separated and normalised (`/` for the
/// storage root, no trailing slash otherwise).
#[async_trait]
pub trait DeviceService: Send + Sync + 'static {
    /// Device side representation of one file.
    type Handle: Send + Sync + 'static;

    async fn list_subfolders(&self, folder: &str) -> DeviceResult<Vec<String>>;

    async fn list_files(&self, folder: &str) -> DeviceResult<Vec<FileInfo>>;

    async fn create_folder(&self, parent: &str, name: &str) -> DeviceResult<()>;

    async fn remove_folder(&self, parent: &str, name: &str) -> DeviceResult<()>;

    /// Load the remote file into a handle. This is the round trip that moves
    /// the file's bytes; `read_all` only hands them out.
    async fn fetch_file_content(&self, folder: &str, name: &str) -> DeviceResult<Self::Handle>;

    /// Handle for a file that does not exist on the device yet.
    fn new_file_handle(&self, folder: &str, name: &str) -> Self::Handle;

    async fn read_all(&self, handle: &Self::Handle) -> DeviceResult<Vec<u8>>;

    /// Store `data` as the complete content of the handle's file. The device
    /// has no in-place update, so callers delete the old entry first.
    async fn replace_content(&self, handle: &mut Self::Handle, data: Vec<u8>) -> DeviceResult<()>;

    async fn delete_file(&self, folder: &str, name: &str) -> DeviceResult<()>;

    /// Best effort, never fails.
    fn release(&self, handle: Self::Handle);

    async fn storage_capacity(&self) -> DeviceResult<Capacity>;
}
