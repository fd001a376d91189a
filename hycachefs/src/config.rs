use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;

use crate::queue::ReplacementPolicy;

/// Default fast-tier budget: 1 GiB.
pub const DEFAULT_BUDGET: u64 = 1 << 30;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Tiered SSD/HDD caching filesystem", long_about = None)]
pub struct Args {
    /// Where the tiered view is mounted
    #[arg(long, env = "HYCACHE_MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// Parent of the default `ssd` and `hdd` tier directories
    #[arg(long, env = "HYCACHE_ROOT")]
    pub root: Option<PathBuf>,

    /// Fast tier directory, `<root>/ssd` when omitted
    #[arg(long, env = "HYCACHE_FAST_ROOT")]
    pub fast_root: Option<PathBuf>,

    /// Slow tier directory, `<root>/hdd` when omitted
    #[arg(long, env = "HYCACHE_SLOW_ROOT")]
    pub slow_root: Option<PathBuf>,

    /// Fast tier capacity, e.g. 512M or 2G
    #[arg(long, env = "HYCACHE_BUDGET", default_value = "1G", value_parser = parse_size)]
    pub budget: u64,

    /// Replacement policy
    #[arg(long, env = "HYCACHE_POLICY", value_enum, default_value_t = ReplacementPolicy::Recency)]
    pub policy: ReplacementPolicy,

    /// Mount through the kernel directly instead of fusermount3
    #[arg(long)]
    pub privileged: bool,

    /// Let other users access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// Permit running as root
    #[arg(long)]
    pub allow_root: bool,

    /// Publish file locations to an in-process metadata index
    #[arg(long)]
    pub metadata_index: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no fast tier: pass --root or --fast-root")]
    MissingFastRoot,

    #[error("no slow tier: pass --root or --slow-root")]
    MissingSlowRoot,

    #[error("tier roots must differ and not contain each other: {0} and {1}")]
    OverlappingRoots(String, String),

    #[error("budget must be greater than zero")]
    ZeroBudget,

    #[error("cannot resolve {0}: {1}")]
    BadPath(String, String),
}

/// Validated mount settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub mountpoint: PathBuf,
    pub fast_root: PathBuf,
    pub slow_root: PathBuf,
    pub budget: u64,
    pub policy: ReplacementPolicy,
    pub privileged: bool,
    pub allow_other: bool,
    pub allow_root: bool,
    pub metadata_index: bool,
}

impl MountConfig {
    pub fn new(fast_root: impl Into<PathBuf>, slow_root: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: PathBuf::new(),
            fast_root: fast_root.into(),
            slow_root: slow_root.into(),
            budget: DEFAULT_BUDGET,
            policy: ReplacementPolicy::default(),
            privileged: false,
            allow_other: false,
            allow_root: false,
            metadata_index: false,
        }
    }
}

impl Args {
    pub fn into_config(self) -> Result<MountConfig, ConfigError> {
        let fast = self
            .fast_root
            .or_else(|| self.root.as_ref().map(|r| r.join("ssd")))
            .ok_or(ConfigError::MissingFastRoot)?;
        let slow = self
            .slow_root
            .or_else(|| self.root.as_ref().map(|r| r.join("hdd")))
            .ok_or(ConfigError::MissingSlowRoot)?;
        let fast = absolute(&fast)?;
        let slow = absolute(&slow)?;
        if fast.starts_with(&slow) || slow.starts_with(&fast) {
            return Err(ConfigError::OverlappingRoots(
                fast.display().to_string(),
                slow.display().to_string(),
            ));
        }
        if self.budget == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        Ok(MountConfig {
            mountpoint: absolute(&self.mountpoint)?,
            fast_root: fast,
            slow_root: slow,
            budget: self.budget,
            policy: self.policy,
            privileged: self.privileged,
            allow_other: self.allow_other,
            allow_root: self.allow_root,
            metadata_index: self.metadata_index,
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path)
        .map_err(|e| ConfigError::BadPath(path.display().to_string(), e.to_string()))
}

/// Parse a byte count with an optional binary suffix (`K`, `M`, `G`, `T`).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {s:?}"))?;
    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        other => return Err(format!("unknown size suffix {other:?}")),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size {s:?} overflows"))
}
