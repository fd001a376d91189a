use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, TierError};

/// An open file or directory, keyed by the opaque handle returned to the
/// kernel.
#[derive(Debug, Clone)]
pub enum Handle {
    File { file: Arc<File>, path: PathBuf },
    Dir(PathBuf),
}

impl Handle {
    pub fn path(&self) -> &Path {
        match self {
            Handle::File { path, .. } => path,
            Handle::Dir(path) => path,
        }
    }
}

#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, Handle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            // 0 is never handed out
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Handle>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, handle: Handle) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(fh, handle);
        fh
    }

    pub fn insert_file(&self, file: File, path: PathBuf) -> u64 {
        self.insert(Handle::File {
            file: Arc::new(file),
            path,
        })
    }

    pub fn insert_dir(&self, path: PathBuf) -> u64 {
        self.insert(Handle::Dir(path))
    }

    /// The open file behind `fh` and the fast path it was opened at.
    pub fn file(&self, fh: u64) -> Result<(Arc<File>, PathBuf)> {
        match self.lock().get(&fh) {
            Some(Handle::File { file, path }) => Ok((file.clone(), path.clone())),
            _ => Err(TierError::BadHandle(fh)),
        }
    }

    pub fn dir(&self, fh: u64) -> Result<PathBuf> {
        match self.lock().get(&fh) {
            Some(Handle::Dir(path)) => Ok(path.clone()),
            _ => Err(TierError::BadHandle(fh)),
        }
    }

    pub fn remove(&self, fh: u64) -> Result<Handle> {
        self.lock().remove(&fh).ok_or(TierError::BadHandle(fh))
    }

    /// Whether any open file refers to `path`.
    pub fn is_open(&self, path: &Path) -> bool {
        self.lock().values().any(|h| match h {
            Handle::File { path: p, .. } => p == path,
            Handle::Dir(_) => false,
        })
    }

    /// Follow a rename: every handle at or below `from` is moved to `to`.
    pub fn rename_path(&self, from: &Path, to: &Path) {
        for handle in self.lock().values_mut() {
            let path = match handle {
                Handle::File { path, .. } => path,
                Handle::Dir(path) => path,
            };
            let moved = match path.strip_prefix(from) {
                Ok(rel) if rel.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rel) => to.join(rel),
                Err(_) => continue,
            };
            *path = moved;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
