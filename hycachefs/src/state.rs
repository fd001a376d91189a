use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{NativeContext, Result};
use crate::meta::{MetadataIndex, TierRecord};
use crate::path::{Tier, TierPaths, is_scratch_name};
use crate::queue::{EvictionQueue, ReplacementPolicy};

/// Everything the tiering engine mutates. Owned by the dispatcher behind a
/// single lock.
pub struct MountState {
    pub paths: TierPaths,
    pub budget: u64,
    /// Last computed fast-tier usage in bytes.
    pub usage: u64,
    pub queue: EvictionQueue,
    index: Option<Arc<dyn MetadataIndex>>,
}

impl MountState {
    pub fn new(paths: TierPaths, budget: u64, policy: ReplacementPolicy) -> Self {
        Self {
            paths,
            budget,
            usage: 0,
            queue: EvictionQueue::new(policy),
            index: None,
        }
    }

    pub fn with_index(mut self, index: Arc<dyn MetadataIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Create both tier roots if needed.
    pub fn prepare_roots(&self) -> Result<()> {
        for tier in [Tier::Fast, Tier::Slow] {
            let root = self.paths.root(tier);
            fs::create_dir_all(root).native("mkdir", root)?;
        }
        Ok(())
    }

    /// Queue every regular file already on the fast tier, oldest access
    /// first, and drop scratch entries left by an interrupted migration.
    pub fn seed(&mut self) -> Result<usize> {
        for tier in [Tier::Fast, Tier::Slow] {
            remove_scratch(self.paths.root(tier));
        }

        let mut resident = Vec::new();
        let walker = WalkDir::new(self.paths.fast_root())
            .follow_links(false)
            .min_depth(1);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("seed walk: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let accessed = entry
                .metadata()
                .ok()
                .and_then(|m| m.accessed().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            resident.push((accessed, entry.into_path()));
        }
        resident.sort();

        let count = resident.len();
        for (_, path) in resident {
            self.queue.touch(&path);
        }
        info!(
            "seeded {} resident files from {}",
            count,
            self.paths.fast_root().display()
        );
        Ok(count)
    }

    /// Record the current location of `fast_path` in the metadata index.
    pub fn publish(&self, fast_path: &Path, tier: Tier, size: u64) {
        let Some(index) = &self.index else {
            return;
        };
        let key = self.paths.virtual_of(fast_path);
        let key = key.to_string_lossy();
        let res = TierRecord::now(tier, size)
            .encode()
            .and_then(|value| index.insert(&key, &value));
        match res {
            Ok(()) => debug!("published {key} on {tier:?}"),
            Err(e) => error!("publish {key}: {e}"),
        }
    }

    pub fn unpublish(&self, fast_path: &Path) {
        let Some(index) = &self.index else {
            return;
        };
        let key = self.paths.virtual_of(fast_path);
        let key = key.to_string_lossy();
        if let Err(e) = index.remove(&key) {
            error!("unpublish {key}: {e}");
        }
    }
}

fn remove_scratch(root: &Path) {
    let walker = WalkDir::new(root).follow_links(false).min_depth(1);
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() || !is_scratch_name(entry.file_name()) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => info!("removed stale scratch {}", entry.path().display()),
            Err(e) => warn!("remove stale scratch {}: {e}", entry.path().display()),
        }
    }
}
