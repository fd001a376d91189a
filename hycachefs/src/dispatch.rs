//! Filesystem verbs over the two tiers.
//!
//! Every path verb resolves its virtual path on the fast tier and holds the
//! mount state lock for its whole duration, so it never sees a path halfway
//! through a migration. Reads and writes on an open handle only touch the
//! handle table.

use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;

use crate::capacity::{RoomReport, make_room};
use crate::config::MountConfig;
use crate::error::{NativeContext, Result, TierError};
use crate::handle::HandleTable;
use crate::meta::InMemoryIndex;
use crate::migrate::{discard, promote};
use crate::path::{Tier, TierPaths, is_scratch_name, scratch_path};
use crate::state::MountState;
use crate::sys::{self, TimeSpec, XattrValue};

/// A directory entry as clients see it. Redirects are reported with the
/// metadata of their slow-tier file.
#[derive(Debug)]
pub struct Entry {
    pub name: OsString,
    pub meta: Metadata,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// The tiered filesystem engine.
pub struct TierFs {
    state: Mutex<MountState>,
    handles: HandleTable,
}

impl TierFs {
    /// Prepare the tier roots, queue files left on the fast tier by an
    /// earlier mount and take the first usage measurement.
    pub fn new(config: &MountConfig) -> Result<Self> {
        let paths = TierPaths::new(&config.fast_root, &config.slow_root);
        let mut state = MountState::new(paths, config.budget, config.policy);
        if config.metadata_index {
            state = state.with_index(Arc::new(InMemoryIndex::new()));
        }
        state.prepare_roots()?;
        state.seed()?;
        let usage = state.refresh_usage();
        info!(
            "tiers ready: fast {} slow {} policy {} usage {} of {} bytes",
            config.fast_root.display(),
            config.slow_root.display(),
            config.policy,
            usage,
            config.budget
        );
        Ok(Self::from_state(state))
    }

    pub fn from_state(state: MountState) -> Self {
        Self {
            state: Mutex::new(state),
            handles: HandleTable::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MountState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the mount state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MountState) -> R) -> R {
        f(&mut self.state())
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn make_room(&self, state: &mut MountState) -> RoomReport {
        make_room(state, |path| self.handles.is_open(path))
    }

    /// The path metadata verbs apply to: the slow file for a migrated path,
    /// the fast path otherwise.
    fn target(state: &MountState, fast: PathBuf) -> Result<PathBuf> {
        if state.paths.is_migrated(&fast) {
            return state.paths.counterpart(&fast, Tier::Fast);
        }
        Ok(fast)
    }

    fn resolved_target(&self, path: &OsStr) -> Result<(MutexGuard<'_, MountState>, PathBuf)> {
        let state = self.state();
        let fast = state.paths.resolve(path)?;
        let target = Self::target(&state, fast)?;
        Ok((state, target))
    }

    pub fn getattr(&self, path: &OsStr) -> Result<Metadata> {
        let state = self.state();
        let fast = state.paths.resolve(path)?;
        attr_of(&state.paths, &fast)
    }

    pub fn fgetattr(&self, fh: u64) -> Result<Metadata> {
        let (file, path) = self.handles.file(fh)?;
        file.metadata().native("fstat", &path)
    }

    pub fn readlink(&self, path: &OsStr) -> Result<PathBuf> {
        let state = self.state();
        let fast = state.paths.resolve(path)?;
        if state.paths.is_migrated(&fast) {
            return Err(TierError::InvalidArgument(format!(
                "{} is not a symbolic link",
                path.to_string_lossy()
            )));
        }
        fs::read_link(&fast).native("readlink", &fast)
    }

    pub fn mknod(&self, path: &OsStr, mode: u32, rdev: u32) -> Result<Metadata> {
        let mut state = self.state();
        let fast = state.paths.resolve_new(path)?;
        let kind = mode & libc::S_IFMT;
        let perm = mode & 0o7777;
        debug!("mknod {} mode {mode:o}", fast.display());
        if kind == libc::S_IFREG || kind == 0 {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(perm)
                .open(&fast)
                .native("mknod", &fast)?;
            state.queue.touch(&fast);
        } else if kind == libc::S_IFIFO {
            nix::unistd::mkfifo(fast.as_path(), Mode::from_bits_truncate(perm as _))
                .native("mkfifo", &fast)?;
        } else {
            nix::sys::stat::mknod(
                fast.as_path(),
                SFlag::from_bits_truncate(kind as _),
                Mode::from_bits_truncate(perm as _),
                rdev as libc::dev_t,
            )
            .native("mknod", &fast)?;
        }
        fs::symlink_metadata(&fast).native("lstat", &fast)
    }

    /// Create the directory on the fast tier and mirror it on the slow one.
    pub fn mkdir(&self, path: &OsStr, mode: u32) -> Result<Metadata> {
        let state = self.state();
        let fast = state.paths.resolve_new(path)?;
        DirBuilder::new()
            .mode(mode)
            .create(&fast)
            .native("mkdir", &fast)?;
        let slow = state.paths.counterpart(&fast, Tier::Fast)?;
        match DirBuilder::new().recursive(true).mode(mode).create(&slow) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => warn!("mirror mkdir {}: {e}", slow.display()),
        }
        fs::symlink_metadata(&fast).native("lstat", &fast)
    }

    pub fn unlink(&self, path: &OsStr) -> Result<()> {
        let mut state = self.state();
        let fast = state.paths.resolve(path)?;
        let slow = if state.paths.is_migrated(&fast) {
            Some(state.paths.counterpart(&fast, Tier::Fast)?)
        } else {
            None
        };
        // the redirect goes first: once it is gone the path is simply absent
        fs::remove_file(&fast).native("unlink", &fast)?;
        state.queue.remove(&fast);
        state.unpublish(&fast);
        if let Some(slow) = slow {
            discard(&slow);
        }
        debug!("unlinked {}", fast.display());
        Ok(())
    }

    /// Remove the directory on both tiers. A missing slow mirror is fine.
    pub fn rmdir(&self, path: &OsStr) -> Result<()> {
        let state = self.state();
        let fast = state.paths.resolve(path)?;
        fs::remove_dir(&fast).native("rmdir", &fast)?;
        let slow = state.paths.counterpart(&fast, Tier::Fast)?;
        match fs::remove_dir(&slow) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("mirror rmdir {}: {e}", slow.display()),
        }
        Ok(())
    }

    /// A user symbolic link, created on the fast tier.
    pub fn symlink(&self, path: &OsStr, target: &OsStr) -> Result<Metadata> {
        let state = self.state();
        let fast = state.paths.resolve_new(path)?;
        symlink(target, &fast).native("symlink", &fast)?;
        fs::symlink_metadata(&fast).native("lstat", &fast)
    }

    pub fn rename(&self, from: &OsStr, to: &OsStr, flags: u32) -> Result<()> {
        if flags & libc::RENAME_EXCHANGE != 0 {
            return Err(TierError::InvalidArgument("RENAME_EXCHANGE".into()));
        }
        let noreplace = flags & libc::RENAME_NOREPLACE != 0;
        let mut state = self.state();
        let src = state.paths.resolve(from)?;
        let dst = state.paths.resolve_new(to)?;
        let src_meta = fs::symlink_metadata(&src).native("lstat", &src)?;
        if src == dst {
            return Ok(());
        }
        // slow content the destination drops once it is replaced
        let dst_slow = if state.paths.is_migrated(&dst) {
            Some(state.paths.counterpart(&dst, Tier::Fast)?)
        } else {
            None
        };

        if src_meta.is_dir() {
            rename_dir(&mut state, &src, &dst, noreplace)?;
        } else if state.paths.is_migrated(&src) {
            rename_migrated(&mut state, &src, &dst, noreplace)?;
        } else {
            sys::rename(&src, &dst, noreplace).native("rename", &src)?;
            if state.queue.contains(&src) {
                state.queue.rename_key(&src, &dst);
            } else {
                state.queue.remove(&dst);
            }
            if let Some(slow) = dst_slow {
                discard(&slow);
            }
            state.unpublish(&src);
        }
        self.handles.rename_path(&src, &dst);
        debug!("renamed {} -> {}", src.display(), dst.display());
        Ok(())
    }

    /// Hard link. A migrated source is linked on the slow tier and gets a
    /// redirect under the new name.
    pub fn link(&self, path: &OsStr, new_path: &OsStr) -> Result<Metadata> {
        let mut state = self.state();
        let src = state.paths.resolve(path)?;
        let dst = state.paths.resolve_new(new_path)?;
        if state.paths.is_migrated(&src) {
            let slow_src = state.paths.counterpart(&src, Tier::Fast)?;
            let slow_dst = state.paths.counterpart(&dst, Tier::Fast)?;
            if let Some(parent) = slow_dst.parent() {
                fs::create_dir_all(parent).native("mkdir", parent)?;
            }
            fs::hard_link(&slow_src, &slow_dst).native("link", &slow_src)?;
            if let Err(e) = symlink(&slow_dst, &dst).native("symlink", &dst) {
                discard(&slow_dst);
                return Err(e);
            }
        } else {
            fs::hard_link(&src, &dst).native("link", &src)?;
            if fs::symlink_metadata(&dst).is_ok_and(|m| m.is_file()) {
                state.queue.touch(&dst);
            }
        }
        attr_of(&state.paths, &dst)
    }

    pub fn chmod(&self, path: &OsStr, mode: u32) -> Result<()> {
        let (_state, target) = self.resolved_target(path)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
            .native("chmod", &target)
    }

    pub fn chown(&self, path: &OsStr, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let (_state, target) = self.resolved_target(path)?;
        std::os::unix::fs::lchown(&target, uid, gid).native("chown", &target)
    }

    pub fn truncate(&self, path: &OsStr, size: u64) -> Result<()> {
        let (_state, target) = self.resolved_target(path)?;
        nix::unistd::truncate(target.as_path(), size as libc::off_t).native("truncate", &target)
    }

    pub fn ftruncate(&self, fh: u64, size: u64) -> Result<()> {
        let (file, path) = self.handles.file(fh)?;
        file.set_len(size).native("ftruncate", &path)
    }

    pub fn utimens(
        &self,
        path: &OsStr,
        atime: Option<TimeSpec>,
        mtime: Option<TimeSpec>,
    ) -> Result<()> {
        let (_state, target) = self.resolved_target(path)?;
        sys::set_times(&target, atime, mtime).native("utimensat", &target)
    }

    /// Promote a migrated path and queue it straight away, so it stays
    /// evictable whatever the caller does next, then make room around it.
    fn bring_back(&self, state: &mut MountState, fast: &Path) -> Result<()> {
        promote(state, fast)?;
        state.queue.touch(fast);
        make_room(state, |p| p == fast || self.handles.is_open(p));
        Ok(())
    }

    /// Open an existing file, bringing it back to the fast tier first if it
    /// was migrated.
    pub fn open(&self, path: &OsStr, flags: u32) -> Result<u64> {
        let mut state = self.state();
        let fast = state.paths.resolve(path)?;
        let promoted = state.paths.is_migrated(&fast);
        if promoted {
            self.bring_back(&mut state, &fast)?;
        }
        let file = open_options(flags).open(&fast).native("open", &fast)?;
        let meta = file.metadata().native("fstat", &fast)?;
        if meta.is_file() && !promoted {
            state.queue.touch(&fast);
        }
        let fh = self.handles.insert_file(file, fast);
        debug!("open {} -> fh {fh}", path.to_string_lossy());
        Ok(fh)
    }

    pub fn create(&self, path: &OsStr, mode: u32, flags: u32) -> Result<(u64, Metadata)> {
        let mut state = self.state();
        let fast = state.paths.resolve_new(path)?;
        let exclusive = flags as i32 & libc::O_EXCL != 0;
        if exclusive && fs::symlink_metadata(&fast).is_ok() {
            let exists = io::Error::from_raw_os_error(libc::EEXIST);
            return Err::<(u64, Metadata), _>(exists).native("create", &fast);
        }
        let promoted = state.paths.is_migrated(&fast);
        if promoted {
            self.bring_back(&mut state, &fast)?;
        } else {
            self.make_room(&mut state);
        }
        let mut options = open_options(flags);
        options.create(true).mode(mode & 0o7777);
        if exclusive {
            options.create_new(true);
        }
        let file = options.open(&fast).native("create", &fast)?;
        let meta = file.metadata().native("fstat", &fast)?;
        if !promoted {
            state.queue.touch(&fast);
        }
        let fh = self.handles.insert_file(file, fast);
        debug!("create {} -> fh {fh}", path.to_string_lossy());
        Ok((fh, meta))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let (file, path) = self.handles.file(fh)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).native("read", &path),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let (file, path) = self.handles.file(fh)?;
        file.write_all_at(data, offset).native("write", &path)?;
        Ok(data.len() as u32)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        self.handles.file(fh).map(|_| ())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let (file, path) = self.handles.file(fh)?;
        if datasync {
            file.sync_data().native("fdatasync", &path)
        } else {
            file.sync_all().native("fsync", &path)
        }
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.remove(fh)?;
        debug!("release fh {fh} ({})", handle.path().display());
        Ok(())
    }

    pub fn statfs(&self, path: &OsStr) -> Result<StatFs> {
        let (_state, target) = self.resolved_target(path)?;
        let st = nix::sys::statvfs::statvfs(target.as_path()).native("statvfs", &target)?;
        Ok(StatFs {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }

    pub fn setxattr(&self, path: &OsStr, name: &OsStr, value: &[u8], flags: u32) -> Result<()> {
        let (_state, target) = self.resolved_target(path)?;
        sys::set_xattr(&target, name, value, flags as i32).native("setxattr", &target)
    }

    pub fn getxattr(&self, path: &OsStr, name: &OsStr, size: u32) -> Result<XattrValue> {
        let (_state, target) = self.resolved_target(path)?;
        sys::get_xattr(&target, name, size as usize).native("getxattr", &target)
    }

    pub fn listxattr(&self, path: &OsStr, size: u32) -> Result<XattrValue> {
        let (_state, target) = self.resolved_target(path)?;
        sys::list_xattr(&target, size as usize).native("listxattr", &target)
    }

    pub fn removexattr(&self, path: &OsStr, name: &OsStr) -> Result<()> {
        let (_state, target) = self.resolved_target(path)?;
        sys::remove_xattr(&target, name).native("removexattr", &target)
    }

    pub fn opendir(&self, path: &OsStr) -> Result<u64> {
        let state = self.state();
        let fast = state.paths.resolve(path)?;
        let meta = fs::metadata(&fast).native("opendir", &fast)?;
        if !meta.is_dir() {
            return Err::<u64, _>(io::Error::from_raw_os_error(libc::ENOTDIR))
                .native("opendir", &fast);
        }
        Ok(self.handles.insert_dir(fast))
    }

    /// Children of the directory at `path`, without `.` and `..`.
    pub fn readdir(&self, path: &OsStr) -> Result<Vec<Entry>> {
        let state = self.state();
        let fast = state.paths.resolve(path)?;
        list_dir(&state.paths, &fast)
    }

    /// Children of an opened directory.
    pub fn readdir_handle(&self, fh: u64) -> Result<Vec<Entry>> {
        let state = self.state();
        let fast = self.handles.dir(fh)?;
        list_dir(&state.paths, &fast)
    }

    pub fn releasedir(&self, fh: u64) -> Result<()> {
        self.handles.remove(fh).map(|_| ())
    }

    pub fn access(&self, path: &OsStr, mask: u32) -> Result<()> {
        let state = self.state();
        let fast = state.paths.resolve(path)?;
        nix::unistd::access(fast.as_path(), AccessFlags::from_bits_truncate(mask as _))
            .native("access", &fast)
    }
}

/// Metadata of a fast path as clients see it.
fn attr_of(paths: &TierPaths, fast: &Path) -> Result<Metadata> {
    if paths.is_migrated(fast) {
        let slow = paths.counterpart(fast, Tier::Fast)?;
        return fs::metadata(&slow).native("stat", &slow);
    }
    fs::symlink_metadata(fast).native("lstat", fast)
}

fn list_dir(paths: &TierPaths, dir: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for child in fs::read_dir(dir).native("readdir", dir)? {
        let child = child.native("readdir", dir)?;
        let name = child.file_name();
        if is_scratch_name(&name) {
            continue;
        }
        match attr_of(paths, &child.path()) {
            Ok(meta) => entries.push(Entry { name, meta }),
            // gone between readdir and stat
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(entries)
}

fn open_options(flags: u32) -> OpenOptions {
    let flags = flags as i32;
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    options.custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_NOCTTY));
    options
}

/// Move the slow content, then the redirect. If the redirect cannot be
/// placed the slow move is undone.
fn rename_migrated(state: &mut MountState, src: &Path, dst: &Path, noreplace: bool) -> Result<()> {
    let slow_src = state.paths.counterpart(src, Tier::Fast)?;
    let slow_dst = state.paths.counterpart(dst, Tier::Fast)?;
    if let Some(parent) = slow_dst.parent() {
        fs::create_dir_all(parent).native("mkdir", parent)?;
    }
    sys::rename(&slow_src, &slow_dst, noreplace).native("rename", &slow_src)?;

    let scratch = scratch_path(dst);
    discard(&scratch);
    let placed = symlink(&slow_dst, &scratch).and_then(|_| sys::rename(&scratch, dst, noreplace));
    if let Err(e) = placed {
        discard(&scratch);
        return undo_rename(&slow_dst, &slow_src, src, dst, e);
    }

    fs::remove_file(src).native("unlink", src)?;
    state.queue.remove(dst);
    state.unpublish(src);
    let size = fs::metadata(&slow_dst).map(|m| m.len()).unwrap_or_default();
    state.publish(dst, Tier::Slow, size);
    Ok(())
}

/// Rename both directory mirrors and carry the queue and the redirects
/// below it along. If the slow mirror cannot follow, the fast rename is
/// undone so the redirects below keep pointing at their content.
fn rename_dir(state: &mut MountState, src: &Path, dst: &Path, noreplace: bool) -> Result<()> {
    let slow_src = state.paths.counterpart(src, Tier::Fast)?;
    let slow_dst = state.paths.counterpart(dst, Tier::Fast)?;
    sys::rename(src, dst, noreplace).native("rename", src)?;
    if slow_src.exists() {
        let moved = slow_dst
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::rename(&slow_src, &slow_dst));
        if let Err(e) = moved {
            warn!(
                "mirror rename {} -> {}: {e}",
                slow_src.display(),
                slow_dst.display()
            );
            return undo_rename(dst, src, src, dst, e);
        }
    }
    state.queue.rename_prefix(src, dst);
    repoint_redirects(dst, &slow_src, &slow_dst);
    Ok(())
}

/// Undo the first half of a two-tier rename of `from` to `to` after the
/// second half failed with `cause`. Always returns an error.
fn undo_rename(moved: &Path, back: &Path, from: &Path, to: &Path, cause: io::Error) -> Result<()> {
    if let Err(rollback) = fs::rename(moved, back) {
        error!(
            "rename {} -> {} interrupted and could not be rolled back: {rollback}",
            from.display(),
            to.display()
        );
        return Err(TierError::InconsistentRename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: cause,
        });
    }
    Err(cause).native("rename", to)
}

/// Rewrite redirects below `dir` whose target lies under `old_slow`.
fn repoint_redirects(dir: &Path, old_slow: &Path, new_slow: &Path) {
    let links = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_symlink());
    for link in links {
        let Ok(target) = fs::read_link(link.path()) else {
            continue;
        };
        let Ok(rel) = target.strip_prefix(old_slow) else {
            continue;
        };
        let new_target = new_slow.join(rel);
        let scratch = scratch_path(link.path());
        let res = symlink(&new_target, &scratch).and_then(|_| fs::rename(&scratch, link.path()));
        if let Err(e) = res {
            discard(&scratch);
            warn!("repoint redirect {}: {e}", link.path().display());
        }
    }
}

impl std::fmt::Debug for TierFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierFs")
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readdir_hides_scratch_and_reports_redirects_as_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TierPaths::new(dir.path().join("ssd"), dir.path().join("hdd"));
        fs::create_dir_all(paths.fast_root()).unwrap();
        fs::create_dir_all(paths.slow_root()).unwrap();
        let slow = paths.slow_root().join("m");
        fs::write(&slow, b"0123456789").unwrap();
        symlink(&slow, paths.fast_root().join("m")).unwrap();
        fs::write(paths.fast_root().join(".m.hycache~"), b"").unwrap();
        fs::write(paths.fast_root().join("r"), b"r").unwrap();

        let mut entries = list_dir(&paths, paths.fast_root()).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![OsString::from("m"), OsString::from("r")]);
        assert!(entries[0].meta.is_file());
        assert_eq!(entries[0].meta.len(), 10);
    }
}
