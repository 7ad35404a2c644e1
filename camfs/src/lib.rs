// Library crate for camfs: the binary and the FUSE smoke test build on these modules.

pub mod config;
pub mod device;
pub mod fuse;
pub mod vfs;
