//! Fast-tier usage accounting and the eviction loop that keeps it within
//! budget.

use std::path::Path;

use log::{debug, warn};
use walkdir::WalkDir;

use crate::error::TierError;
use crate::migrate::demote;
use crate::state::MountState;

/// Apparent size of every regular file and redirect below `root`. Links
/// count their own size, not their target's. The root itself and
/// directories are not counted.
pub fn usage_estimate(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let kind = entry.file_type();
            kind.is_file() || kind.is_symlink()
        })
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Outcome of a [`make_room`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomReport {
    pub evicted: usize,
    pub usage: u64,
    pub over_budget: bool,
}

impl RoomReport {
    /// The capacity warning to surface, if the pass could not reach the
    /// budget.
    pub fn warning(&self, budget: u64) -> Option<TierError> {
        self.over_budget.then_some(TierError::CapacityExceeded {
            usage: self.usage,
            budget,
        })
    }
}

impl MountState {
    pub fn refresh_usage(&mut self) -> u64 {
        self.usage = usage_estimate(self.paths.fast_root());
        self.usage
    }

    pub fn is_over_budget(&mut self) -> bool {
        self.refresh_usage() > self.budget
    }
}

/// Demote queue heads until the fast tier fits the budget or nothing is
/// left to evict. Paths for which `pinned` returns true are never chosen.
///
/// A candidate that vanished from disk is dropped. One that fails to demote
/// for another reason sits out the rest of the pass and is then requeued
/// behind its equals, so a single stuck file cannot block eviction.
pub fn make_room<F>(state: &mut MountState, pinned: F) -> RoomReport
where
    F: Fn(&Path) -> bool,
{
    let mut report = RoomReport::default();
    let mut failed = Vec::new();
    // each iteration takes one entry off the queue, so this ends after at
    // most N steps
    while state.is_over_budget() {
        let Some(victim) = state.queue.evict_where(&pinned) else {
            break;
        };
        match demote(state, &victim.path) {
            Ok(bytes) => {
                report.evicted += 1;
                debug!("evicted {} ({bytes} bytes)", victim.path.display());
            }
            Err(e) if e.is_not_found() => {
                debug!("dropped vanished entry {}", victim.path.display());
            }
            Err(e) => {
                warn!("eviction of {} failed: {e}", victim.path.display());
                failed.push(victim);
            }
        }
    }
    for entry in failed {
        state.queue.requeue(entry);
    }
    report.usage = state.usage;
    report.over_budget = state.usage > state.budget;
    if let Some(warning) = report.warning(state.budget) {
        warn!("{warning}");
    }
    report
}
