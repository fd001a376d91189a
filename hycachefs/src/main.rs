use anyhow::{Context, bail};
use clap::Parser;
use log::info;

use hycachefs::fuse::mount::{mount_tiers, serve_until_interrupted};
use hycachefs::{Args, TierFs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.into_config().context("invalid mount configuration")?;

    if nix::unistd::geteuid().is_root() && !config.allow_root {
        bail!("refusing to run as root; pass --allow-root to override");
    }

    let tiers = TierFs::new(&config).with_context(|| {
        format!(
            "failed to prepare tiers {} and {}",
            config.fast_root.display(),
            config.slow_root.display()
        )
    })?;

    let handle = mount_tiers(tiers, &config)
        .await
        .with_context(|| format!("failed to mount at {}", config.mountpoint.display()))?;
    serve_until_interrupted(handle, &config.mountpoint)
        .await
        .context("mount session ended with an error")?;
    info!("unmounted {}", config.mountpoint.display());
    Ok(())
}
