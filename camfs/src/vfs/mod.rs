//! VFS layer (camera storage cache)
//!
//! Responsibilities:
//! - Mirror the device's folder tree in memory, reading each folder from the
//!   device only when it is first needed.
//! - Resolve absolute paths to cached nodes.
//! - Buffer whole files in memory between open and release and write them
//!   back to the device when the last change is closed.
//! - Serve the path based operations the FUSE adapter translates requests
//!   into.
//!
//! Submodules:
//! - `node`: directory and file nodes of the cached tree
//! - `resolve`: path resolution with on-demand population
//! - `populate`: folder listing from the device
//! - `file`: file buffers and write-back
//! - `handles`: open file handle table
//! - `cache`: storage capacity cache
//! - `session`: the shared context and directory level operations
pub mod attr;
pub mod cache;
pub mod error;
pub mod file;
pub mod handles;
pub mod node;
pub mod path;
pub mod populate;
pub mod resolve;
pub mod session;

pub use attr::{DirEntry, FileAttr, FileType, Identity, StatFs};
pub use error::{VfsError, VfsResult};
pub use session::{Session, SessionOptions};

