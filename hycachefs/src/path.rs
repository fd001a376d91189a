//! Virtual path to tier path mapping.
//!
//! Every virtual path lives on the fast tier first: a resident file is a real
//! file under the fast root, a migrated file is a symlink under the fast root
//! whose target is the same relative path under the slow root.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TierError};

/// Suffix of the scratch entries used while swapping a path between tiers.
pub const SCRATCH_SUFFIX: &str = ".hycache~";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Slow,
}

impl Tier {
    pub fn other(self) -> Tier {
        match self {
            Tier::Fast => Tier::Slow,
            Tier::Slow => Tier::Fast,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TierPaths {
    fast: PathBuf,
    slow: PathBuf,
}

impl TierPaths {
    pub fn new(fast: impl Into<PathBuf>, slow: impl Into<PathBuf>) -> Self {
        Self {
            fast: fast.into(),
            slow: slow.into(),
        }
    }

    pub fn root(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Slow => &self.slow,
        }
    }

    pub fn fast_root(&self) -> &Path {
        &self.fast
    }

    pub fn slow_root(&self) -> &Path {
        &self.slow
    }

    /// Map a virtual path (as handed out by the kernel, rooted at `/`) to
    /// its fast-tier path.
    /// Scratch names are never visible, so they resolve as missing.
    pub fn resolve(&self, virtual_path: &OsStr) -> Result<PathBuf> {
        let path = Path::new(virtual_path);
        if path.file_name().is_some_and(is_scratch_name) {
            return Err(TierError::NotFound(path.to_path_buf()));
        }
        let relative = path.strip_prefix("/").unwrap_or(path);
        let full = self.fast.join(relative);
        if full.as_os_str().len() >= libc::PATH_MAX as usize {
            return Err(TierError::PathTooLong(full));
        }
        Ok(full)
    }

    /// Like [`resolve`](Self::resolve), for a name about to be created.
    /// Scratch names are reserved and refused.
    pub fn resolve_new(&self, virtual_path: &OsStr) -> Result<PathBuf> {
        if Path::new(virtual_path).file_name().is_some_and(is_scratch_name) {
            return Err(TierError::InvalidArgument(format!(
                "{} is a reserved name",
                virtual_path.to_string_lossy()
            )));
        }
        self.resolve(virtual_path)
    }

    /// The sibling of `path` on the other tier. Pure prefix substitution.
    pub fn counterpart(&self, path: &Path, from: Tier) -> Result<PathBuf> {
        let root = self.root(from);
        let relative = path
            .strip_prefix(root)
            .map_err(|_| TierError::OutsideTier {
                path: path.to_path_buf(),
                root: root.to_path_buf(),
            })?;
        if relative.as_os_str().is_empty() {
            return Ok(self.root(from.other()).to_path_buf());
        }
        Ok(self.root(from.other()).join(relative))
    }

    /// The virtual path of a fast-tier path, used for logs and the
    /// metadata index.
    pub fn virtual_of(&self, fast_path: &Path) -> PathBuf {
        match fast_path.strip_prefix(&self.fast) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => fast_path.to_path_buf(),
        }
    }

    /// A fast path is migrated iff it is a symlink and its slow counterpart
    /// exists.
    pub fn is_migrated(&self, fast_path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(fast_path) else {
            return false;
        };
        if !meta.file_type().is_symlink() {
            return false;
        }
        match self.counterpart(fast_path, Tier::Fast) {
            Ok(slow) => slow.exists(),
            Err(_) => false,
        }
    }
}

/// Join a child name onto a virtual parent path.
pub fn join_virtual(parent: &OsStr, name: &OsStr) -> OsString {
    let mut out = OsString::from(parent);
    if !parent.as_bytes().ends_with(b"/") {
        out.push("/");
    }
    out.push(name);
    out
}

/// Scratch sibling of `path` used for atomic replacement.
pub fn scratch_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(SCRATCH_SUFFIX);
    path.with_file_name(name)
}

pub fn is_scratch_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes.starts_with(b".") && bytes.ends_with(SCRATCH_SUFFIX.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn tiers() -> TierPaths {
        TierPaths::new("/data/ssd", "/data/hdd")
    }

    #[test]
    fn resolve_joins_fast_root() {
        let paths = tiers();
        assert_eq!(
            paths.resolve(OsStr::new("/a/b.txt")).unwrap(),
            PathBuf::from("/data/ssd/a/b.txt")
        );
        assert_eq!(
            paths.resolve(OsStr::new("/")).unwrap(),
            PathBuf::from("/data/ssd")
        );
    }

    #[test]
    fn scratch_names_are_hidden_and_reserved() {
        let paths = tiers();
        let err = paths.resolve(OsStr::new("/d/.notes.hycache~")).unwrap_err();
        assert!(err.is_not_found());
        let err = paths.resolve_new(OsStr::new("/.notes.hycache~")).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(
            paths.resolve_new(OsStr::new("/notes.hycache~")).unwrap(),
            PathBuf::from("/data/ssd/notes.hycache~")
        );
    }

    #[test]
    fn resolve_rejects_overlong_paths() {
        let long = format!("/{}", "x".repeat(libc::PATH_MAX as usize));
        let err = tiers().resolve(OsStr::new(&long)).unwrap_err();
        assert!(matches!(err, TierError::PathTooLong(_)));
    }

    #[test]
    fn counterpart_swaps_roots_both_ways() {
        let paths = tiers();
        let slow = paths
            .counterpart(Path::new("/data/ssd/dir/f"), Tier::Fast)
            .unwrap();
        assert_eq!(slow, PathBuf::from("/data/hdd/dir/f"));
        let fast = paths.counterpart(&slow, Tier::Slow).unwrap();
        assert_eq!(fast, PathBuf::from("/data/ssd/dir/f"));
        assert_eq!(
            paths.counterpart(Path::new("/data/ssd"), Tier::Fast).unwrap(),
            PathBuf::from("/data/hdd")
        );
    }

    #[test]
    fn counterpart_outside_root_fails() {
        let err = tiers()
            .counterpart(Path::new("/elsewhere/f"), Tier::Fast)
            .unwrap_err();
        assert!(matches!(err, TierError::OutsideTier { .. }));
    }

    #[test]
    fn is_migrated_needs_link_and_slow_copy() {
        let root = tempfile::tempdir().unwrap();
        let paths = TierPaths::new(root.path().join("ssd"), root.path().join("hdd"));
        fs::create_dir_all(paths.fast_root()).unwrap();
        fs::create_dir_all(paths.slow_root()).unwrap();

        let resident = paths.fast_root().join("resident");
        fs::write(&resident, b"x").unwrap();
        assert!(!paths.is_migrated(&resident));

        let migrated = paths.fast_root().join("migrated");
        let slow = paths.slow_root().join("migrated");
        fs::write(&slow, b"y").unwrap();
        symlink(&slow, &migrated).unwrap();
        assert!(paths.is_migrated(&migrated));

        // a user symlink without a slow counterpart is not a redirect
        let user_link = paths.fast_root().join("link");
        symlink(&resident, &user_link).unwrap();
        assert!(!paths.is_migrated(&user_link));

        assert!(!paths.is_migrated(&paths.fast_root().join("absent")));
    }

    #[test]
    fn virtual_paths() {
        assert_eq!(
            join_virtual(OsStr::new("/"), OsStr::new("a")),
            OsString::from("/a")
        );
        assert_eq!(
            join_virtual(OsStr::new("/a"), OsStr::new("b")),
            OsString::from("/a/b")
        );
        assert_eq!(
            tiers().virtual_of(Path::new("/data/ssd/a/b")),
            PathBuf::from("/a/b")
        );
    }

    #[test]
    fn scratch_names_are_recognised() {
        let scratch = scratch_path(Path::new("/data/ssd/dir/file"));
        assert_eq!(scratch, PathBuf::from("/data/ssd/dir/.file.hycache~"));
        assert!(is_scratch_name(scratch.file_name().unwrap()));
        assert!(!is_scratch_name(OsStr::new("file")));
    }
}
