//! Moving file content between tiers.
//!
//! Both directions copy first and then swap with a single rename(2) of a
//! scratch entry over the fast path, so the fast path is always either the
//! real file or a complete redirect.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{MetadataExt, symlink};
use std::path::Path;

use log::{info, warn};

use crate::error::{NativeContext, Result, TierError};
use crate::path::{Tier, scratch_path};
use crate::state::MountState;
use crate::sys::{self, TimeSpec};

/// Move a resident file to the slow tier and leave a redirect behind.
/// Returns the number of bytes moved.
pub fn demote(state: &mut MountState, fast_path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(fast_path).native("lstat", fast_path)?;
    if meta.file_type().is_symlink() && state.paths.is_migrated(fast_path) {
        return Err(TierError::migration(fast_path, "already migrated"));
    }
    if !meta.file_type().is_file() {
        return Err(TierError::migration(fast_path, "not a regular file"));
    }

    let slow_path = state.paths.counterpart(fast_path, Tier::Fast)?;
    if let Some(parent) = slow_path.parent() {
        fs::create_dir_all(parent).native("mkdir", parent)?;
    }

    let slow_scratch = scratch_path(&slow_path);
    copy_preserving(fast_path, &slow_scratch, &meta)
        .and_then(|_| fs::rename(&slow_scratch, &slow_path).native("rename", &slow_scratch))
        .inspect_err(|_| discard(&slow_scratch))?;

    let link_scratch = scratch_path(fast_path);
    discard(&link_scratch);
    let swapped = symlink(&slow_path, &link_scratch)
        .native("symlink", &link_scratch)
        .and_then(|_| fs::rename(&link_scratch, fast_path).native("rename", &link_scratch));
    if let Err(e) = swapped {
        discard(&link_scratch);
        discard(&slow_path);
        return Err(e);
    }

    state.queue.remove(fast_path);
    state.publish(fast_path, Tier::Slow, meta.len());
    info!(
        "demoted {} ({} bytes)",
        state.paths.virtual_of(fast_path).display(),
        meta.len()
    );
    Ok(meta.len())
}

/// Bring a migrated file back to the fast tier, replacing its redirect.
/// The caller decides whether and how to queue it.
pub fn promote(state: &mut MountState, fast_path: &Path) -> Result<u64> {
    if !state.paths.is_migrated(fast_path) {
        return Err(TierError::migration(fast_path, "not migrated"));
    }
    let slow_path = state.paths.counterpart(fast_path, Tier::Fast)?;
    let meta = fs::metadata(&slow_path).native("stat", &slow_path)?;

    let scratch = scratch_path(fast_path);
    discard(&scratch);
    copy_preserving(&slow_path, &scratch, &meta)
        .and_then(|_| fs::rename(&scratch, fast_path).native("rename", &scratch))
        .inspect_err(|_| discard(&scratch))?;

    if let Err(e) = fs::remove_file(&slow_path) {
        warn!("remove slow copy {}: {e}", slow_path.display());
    }
    state.publish(fast_path, Tier::Fast, meta.len());
    info!(
        "promoted {} ({} bytes)",
        state.paths.virtual_of(fast_path).display(),
        meta.len()
    );
    Ok(meta.len())
}

/// Copy content and mode, then timestamps; ownership is best effort.
fn copy_preserving(from: &Path, to: &Path, meta: &Metadata) -> Result<()> {
    fs::copy(from, to).native("copy", from)?;
    sys::set_times(
        to,
        Some(TimeSpec {
            sec: meta.atime(),
            nsec: meta.atime_nsec() as u32,
        }),
        Some(TimeSpec {
            sec: meta.mtime(),
            nsec: meta.mtime_nsec() as u32,
        }),
    )
    .native("utimensat", to)?;
    if let Err(e) = std::os::unix::fs::chown(to, Some(meta.uid()), Some(meta.gid())) {
        if e.raw_os_error() != Some(libc::EPERM) {
            warn!("chown {}: {e}", to.display());
        }
    }
    Ok(())
}

pub(crate) fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("cleanup {}: {e}", path.display()),
    }
}
