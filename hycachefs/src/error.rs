use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TierError>;

#[derive(Debug, Error)]
pub enum TierError {
    #[error("{} not found", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied on {}", .0.display())]
    PermissionDenied(PathBuf),

    /// Warning-level: the fast tier stays over budget after eviction.
    #[error("fast tier over budget: {usage} bytes used, budget {budget} bytes")]
    CapacityExceeded { usage: u64, budget: u64 },

    /// Evicting from an empty queue is a logic error in the caller.
    #[error("eviction queue is empty")]
    EmptyQueue,

    #[error("migration of {} failed: {reason}", path.display())]
    MigrationFailed { path: PathBuf, reason: String },

    #[error(
        "rename {} -> {} left the tiers inconsistent: {source}",
        from.display(),
        to.display()
    )]
    InconsistentRename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{call} {}: {source}", path.display())]
    NativeIo {
        call: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("path too long: {}", .0.display())]
    PathTooLong(PathBuf),

    #[error("{} is outside tier root {}", path.display(), root.display())]
    OutsideTier { path: PathBuf, root: PathBuf },

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TierError {
    pub fn migration(path: &Path, reason: impl Into<String>) -> Self {
        TierError::MigrationFailed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Errno handed back to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            TierError::NotFound(_) => libc::ENOENT,
            TierError::PermissionDenied(_) => libc::EACCES,
            TierError::CapacityExceeded { .. } => libc::ENOSPC,
            TierError::EmptyQueue
            | TierError::MigrationFailed { .. }
            | TierError::InconsistentRename { .. } => libc::EIO,
            TierError::NativeIo { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            TierError::PathTooLong(_) => libc::ENAMETOOLONG,
            TierError::OutsideTier { .. } => libc::EXDEV,
            TierError::BadHandle(_) => libc::EBADF,
            TierError::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// True when the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            TierError::NotFound(_) => true,
            TierError::NativeIo { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    fn from_native(call: &'static str, path: &Path, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::ENOENT) => TierError::NotFound(path.to_path_buf()),
            Some(libc::EACCES) => TierError::PermissionDenied(path.to_path_buf()),
            _ => TierError::NativeIo {
                call,
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

impl From<TierError> for rfuse3::Errno {
    fn from(err: TierError) -> Self {
        rfuse3::Errno::from(err.errno())
    }
}

/// Lifts the result of a native call into a [`TierError`], keeping the
/// failing call and the path it was applied to.
pub(crate) trait NativeContext<T> {
    fn native(self, call: &'static str, path: &Path) -> Result<T>;
}

impl<T> NativeContext<T> for io::Result<T> {
    fn native(self, call: &'static str, path: &Path) -> Result<T> {
        self.map_err(|e| TierError::from_native(call, path, e))
    }
}

impl<T> NativeContext<T> for nix::Result<T> {
    fn native(self, call: &'static str, path: &Path) -> Result<T> {
        self.map_err(|e| TierError::from_native(call, path, io::Error::from(e)))
    }
}
