use std::path::PathBuf;
use std::time::SystemTime;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Replacement policy of an eviction queue. Fixed for the lifetime of a
/// mount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    /// Least recently used at the head.
    #[default]
    #[value(name = "lru")]
    Recency,
    /// Least frequently used at the head, ties broken by recency.
    #[value(name = "lfu")]
    Frequency,
}

/// A resident file tracked by the eviction queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Absolute fast-tier path.
    pub path: PathBuf,
    pub freq: u64,
    pub touched: SystemTime,
}

impl CacheEntry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            freq: 1,
            touched: SystemTime::now(),
        }
    }

    pub(super) fn bump(&mut self) {
        self.freq = self.freq.saturating_add(1);
        self.touched = SystemTime::now();
    }
}

impl std::fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplacementPolicy::Recency => write!(f, "lru"),
            ReplacementPolicy::Frequency => write!(f, "lfu"),
        }
    }
}
