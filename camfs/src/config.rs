use crate::vfs::{Identity, SessionOptions};
use anyhow::bail;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about = "Camera storage as a lazily cached filesystem", long_about = None)]
pub struct Args {
    /// Directory to mount the camera storage on
    #[arg(env = "CAMFS_MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// Host directory standing in for camera storage
    #[arg(long, env = "CAMFS_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Serve an in-memory demo camera
    #[arg(long, env = "CAMFS_DEMO")]
    pub demo: bool,

    /// Owner reported for every entry [default: the mounting user]
    #[arg(long, env = "CAMFS_UID")]
    pub uid: Option<u32>,

    /// Group reported for every entry [default: the mounting user's group]
    #[arg(long, env = "CAMFS_GID")]
    pub gid: Option<u32>,

    /// How long a storage capacity answer is reused, 0 to always ask the device
    #[arg(long, env = "CAMFS_CAPACITY_TTL_SECS", default_value_t = 5)]
    pub capacity_ttl_secs: u64,

    /// Largest file, in bytes, that may be buffered for writing
    #[arg(long, env = "CAMFS_MAX_FILE_SIZE", default_value_t = 4 << 30)]
    pub max_file_size: u64,

    /// Let other users access the mount
    #[arg(long, env = "CAMFS_ALLOW_OTHER")]
    pub allow_other: bool,

    /// Mount with mount(2) instead of fusermount3
    #[arg(long, env = "CAMFS_PRIVILEGED")]
    pub privileged: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "CAMFS_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSource {
    Demo,
    StorageDir(PathBuf),
}

#[derive(Clone, Debug)]
pub struct MountConfig {
    pub mountpoint: PathBuf,
    pub source: DeviceSource,
    pub session: SessionOptions,
    pub allow_other: bool,
    pub privileged: bool,
}

/// Check the arguments and report every problem at once.
pub async fn validate_config(args: &Args) -> anyhow::Result<MountConfig> {
    let mut validation_errors = Vec::new();

    if let Err(e) = check_dir(&args.mountpoint).await {
        validation_errors.push(format!("mountpoint {e}"));
    }

    let source = match (&args.storage_dir, args.demo) {
        (Some(_), true) => {
            validation_errors.push("--storage-dir and --demo are mutually exclusive".into());
            None
        }
        (None, false) => {
            validation_errors.push("one of --storage-dir or --demo is required".into());
            None
        }
        (None, true) => Some(DeviceSource::Demo),
        (Some(dir), false) => match check_dir(dir).await {
            Ok(()) => Some(DeviceSource::StorageDir(dir.clone())),
            Err(e) => {
                validation_errors.push(format!("CAMFS_STORAGE_DIR {e}"));
                None
            }
        },
    };

    if args.max_file_size == 0 {
        validation_errors.push("CAMFS_MAX_FILE_SIZE must be greater than 0".into());
    }

    let (Some(source), true) = (source, validation_errors.is_empty()) else {
        bail!("{}", validation_errors.join("\n"));
    };

    let current = Identity::current();
    Ok(MountConfig {
        mountpoint: args.mountpoint.clone(),
        source,
        session: SessionOptions {
            owner: Identity {
                uid: args.uid.unwrap_or(current.uid),
                gid: args.gid.unwrap_or(current.gid),
            },
            capacity_ttl: Duration::from_secs(args.capacity_ttl_secs),
            max_file_size: args.max_file_size,
        },
        allow_other: args.allow_other,
        privileged: args.privileged,
    })
}

async fn check_dir(path: &Path) -> Result<(), String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(format!("`{}` exists but is not a directory", path.display())),
        Err(_) => Err(format!("`{}` does not exist", path.display())),
    }
}
