//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux the unprivileged mount goes
//!   through fusermount3.
//! - Thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::MountHandle;

use super::CamFs;
use crate::device::DeviceService;
use crate::vfs::Identity;

fn mount_options(owner: Identity, allow_other: bool) -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("camfs")
        .force_readdir_plus(true)
        .uid(owner.uid)
        .gid(owner.gid);
    if allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mount through fusermount3; needs no privileges beyond access to /dev/fuse.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<D: DeviceService>(
    fs: CamFs<D>,
    mount_point: impl AsRef<Path>,
    allow_other: bool,
) -> std::io::Result<MountHandle> {
    let opts = mount_options(fs.session().owner(), allow_other);
    rfuse3::raw::Session::new(opts)
        .mount_with_unprivileged(fs, mount_point.as_ref())
        .await
}

/// Mount directly; the process must be allowed to call mount(2).
#[cfg(target_os = "linux")]
pub async fn mount_privileged<D: DeviceService>(
    fs: CamFs<D>,
    mount_point: impl AsRef<Path>,
    allow_other: bool,
) -> std::io::Result<MountHandle> {
    let opts = mount_options(fs.session().owner(), allow_other);
    rfuse3::raw::Session::new(opts)
        .mount(fs, mount_point.as_ref())
        .await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<D: DeviceService>(
    _fs: CamFs<D>,
    _mount_point: impl AsRef<Path>,
    _allow_other: bool,
) -> std::io::Result<MountHandle> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_privileged<D: DeviceService>(
    _fs: CamFs<D>,
    _mount_point: impl AsRef<Path>,
    _allow_other: bool,
) -> std::io::Result<MountHandle> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    )
}
