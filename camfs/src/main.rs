use camfs::config::{Args, DeviceSource, MountConfig, validate_config};
use camfs::device::{DeviceService, LocalDirDevice, MemoryDevice};
use camfs::fuse::CamFs;
use camfs::fuse::mount::{mount_privileged, mount_unprivileged};
use camfs::vfs::Session;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match validate_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    match config.source.clone() {
        DeviceSource::Demo => run(demo_camera(), config).await,
        DeviceSource::StorageDir(dir) => run(LocalDirDevice::new(dir), config).await,
    }
}

fn demo_camera() -> MemoryDevice {
    let device = MemoryDevice::new();
    device.seed_folder("/DCIM/100CAMFS");
    device
}

async fn run<D: DeviceService>(device: D, config: MountConfig) -> anyhow::Result<()> {
    let session = Arc::new(Session::new(device, config.session.clone()));
    let fs = CamFs::new(session.clone());

    let mut handle = if config.privileged {
        mount_privileged(fs, &config.mountpoint, config.allow_other).await?
    } else {
        mount_unprivileged(fs, &config.mountpoint, config.allow_other).await?
    };
    info!(mountpoint = %config.mountpoint.display(), "camfs mounted");

    let mut terminate = unix_signal(SignalKind::terminate())?;
    let mut hangup = unix_signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            res = &mut handle => {
                res?;
                break;
            }
            _ = signal::ctrl_c() => {
                handle.unmount().await?;
                break;
            }
            _ = terminate.recv() => {
                handle.unmount().await?;
                break;
            }
            _ = hangup.recv() => match session.invalidate("/").await {
                Ok(()) => info!("cache dropped, folders will be re-read"),
                Err(e) => warn!("cache kept: {e}"),
            },
        }
    }

    // destroy() already ran if the kernel sent it; teardown is idempotent.
    session.teardown().await;
    info!("camfs unmounted");
    Ok(())
}
