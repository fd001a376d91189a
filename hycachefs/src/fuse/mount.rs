//! Mount helpers for starting and stopping the tiered filesystem.
//!
//! Thin wrappers over the rfuse3 raw `Session`. Unprivileged mounts go
//! through fusermount3 and are the default.

use std::io;
use std::path::Path;

use log::info;
use rfuse3::MountOptions;
use rfuse3::raw::MountHandle;
#[cfg(target_os = "linux")]
use rfuse3::raw::Session;

use crate::config::MountConfig;
use crate::dispatch::TierFs;
#[cfg(target_os = "linux")]
use crate::fuse::TierFuse;

/// Mount options for a tiered mount owned by the calling user.
pub fn mount_options(config: &MountConfig) -> MountOptions {
    let mut options = MountOptions::default();
    options
        .fs_name("hycachefs")
        .uid(nix::unistd::getuid().as_raw())
        .gid(nix::unistd::getgid().as_raw());
    if config.allow_other {
        options.allow_other(true);
    }
    options
}

#[cfg(target_os = "linux")]
pub async fn mount_tiers(tiers: TierFs, config: &MountConfig) -> io::Result<MountHandle> {
    let fs = TierFuse::new(tiers);
    let session = Session::new(mount_options(config));
    let handle = if config.privileged {
        session.mount(fs, &config.mountpoint).await?
    } else {
        session.mount_with_unprivileged(fs, &config.mountpoint).await?
    };
    info!("mounted at {}", config.mountpoint.display());
    Ok(handle)
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_tiers(_tiers: TierFs, _config: &MountConfig) -> io::Result<MountHandle> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

/// Wait until the mount ends or ctrl-c arrives, then unmount.
pub async fn serve_until_interrupted(mut handle: MountHandle, mountpoint: &Path) -> io::Result<()> {
    let waiting = &mut handle;
    tokio::select! {
        res = waiting => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, unmounting {}", mountpoint.display());
            handle.unmount().await?;
        }
    }
    Ok(())
}
