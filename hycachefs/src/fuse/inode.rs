//! Inode numbers for virtual paths.
//!
//! The kernel addresses files by inode, the engine by virtual path. A number
//! is handed out the first time a path is looked up and lives until the
//! kernel forgets every lookup it was given for it.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rfuse3::{Errno, Inode};

use crate::path::join_virtual;

pub const ROOT_INO: Inode = 1;

/// Reported in plain readdir replies for children never looked up.
pub const UNKNOWN_INO: Inode = 0xffff_ffff;

struct Node {
    path: OsString,
    lookups: u64,
}

struct Inner {
    next: Inode,
    by_ino: HashMap<Inode, Node>,
    by_path: HashMap<OsString, Inode>,
}

impl Inner {
    fn drop_path(&mut self, path: &OsStr) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    fn paths_under(&self, dir: &OsStr) -> Vec<OsString> {
        self.by_path
            .keys()
            .filter(|p| is_under(p, dir))
            .cloned()
            .collect()
    }
}

/// `path` is `dir` itself or lies below it.
fn is_under(path: &OsStr, dir: &OsStr) -> bool {
    let (path, dir) = (path.as_bytes(), dir.as_bytes());
    path == dir || (path.starts_with(dir) && path.get(dir.len()) == Some(&b'/'))
}

pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let root = OsString::from("/");
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            Node {
                path: root.clone(),
                lookups: 1,
            },
        );
        by_path.insert(root, ROOT_INO);
        Self {
            inner: Mutex::new(Inner {
                next: ROOT_INO + 1,
                by_ino,
                by_path,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Virtual path of a known inode.
    pub fn path(&self, ino: Inode) -> Result<OsString, Errno> {
        self.lock()
            .by_ino
            .get(&ino)
            .map(|n| n.path.clone())
            .ok_or_else(Errno::new_not_exist)
    }

    /// Virtual path of `name` inside the directory `parent`.
    pub fn child(&self, parent: Inode, name: &OsStr) -> Result<OsString, Errno> {
        Ok(join_virtual(&self.path(parent)?, name))
    }

    /// Inode of the directory holding `path`, the root for the root.
    pub fn parent_of(&self, path: &OsStr) -> Inode {
        Path::new(path)
            .parent()
            .and_then(|p| self.peek(p.as_os_str()))
            .unwrap_or(ROOT_INO)
    }

    /// Inode for `path`, allocated on first use. Counts one kernel lookup.
    pub fn lookup(&self, path: &OsStr) -> Inode {
        let mut inner = self.lock();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(node) = inner.by_ino.get_mut(&ino) {
                node.lookups += 1;
            }
            return ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.by_ino.insert(
            ino,
            Node {
                path: path.to_os_string(),
                lookups: 1,
            },
        );
        inner.by_path.insert(path.to_os_string(), ino);
        ino
    }

    /// Inode for `path` if the kernel already holds one.
    pub fn peek(&self, path: &OsStr) -> Option<Inode> {
        self.lock().by_path.get(path).copied()
    }

    /// Drop `nlookup` kernel references. The root is never released.
    pub fn forget(&self, ino: Inode, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.lock();
        let Some(node) = inner.by_ino.get_mut(&ino) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(nlookup);
        if node.lookups == 0 {
            let path = node.path.clone();
            inner.by_ino.remove(&ino);
            if inner.by_path.get(&path) == Some(&ino) {
                inner.by_path.remove(&path);
            }
        }
    }

    /// Re-key `from` and everything below it to live under `to`. Whatever
    /// was known at `to` was replaced and is dropped.
    pub fn rename(&self, from: &OsStr, to: &OsStr) {
        let mut inner = self.lock();
        for stale in inner.paths_under(to) {
            inner.drop_path(&stale);
        }
        for old in inner.paths_under(from) {
            let Some(ino) = inner.by_path.remove(&old) else {
                continue;
            };
            let mut new = to.to_os_string();
            new.push(OsStr::from_bytes(&old.as_bytes()[from.len()..]));
            if let Some(node) = inner.by_ino.get_mut(&ino) {
                node.path = new.clone();
            }
            inner.by_path.insert(new, ino);
        }
    }

    /// Forget the path of an unlinked file or removed directory.
    pub fn remove(&self, path: &OsStr) {
        self.lock().drop_path(path);
    }

    pub fn len(&self) -> usize {
        self.lock().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
