//! FUSE adapter.
//!
//! [`TierFuse`] implements the rfuse3 inode-based `Filesystem` on top of
//! [`TierFs`]. Inodes are mapped to virtual paths by an [`InodeTable`];
//! every request becomes one call on the tiering engine and its error an
//! errno.
pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::fs::{FileType as StdFileType, Metadata};
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use log::debug;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
    ReplyXAttr,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Inode, Result as FuseResult, SetAttr, Timestamp};

use crate::dispatch::{Entry, TierFs};
use crate::path::join_virtual;
use crate::sys::{TimeSpec, XattrValue};

pub use inode::{InodeTable, ROOT_INO, UNKNOWN_INO};

const TTL: Duration = Duration::from_secs(1);

/// The tiering engine as seen by the kernel.
pub struct TierFuse {
    tiers: TierFs,
    inodes: InodeTable,
}

impl TierFuse {
    pub fn new(tiers: TierFs) -> Self {
        Self {
            tiers,
            inodes: InodeTable::new(),
        }
    }

    pub fn tiers(&self) -> &TierFs {
        &self.tiers
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// Entry reply for `path`; counts as one kernel lookup.
    fn entry(&self, path: &OsStr, meta: &Metadata) -> ReplyEntry {
        let ino = self.inodes.lookup(path);
        ReplyEntry {
            ttl: TTL,
            attr: file_attr(meta, ino),
            generation: 0,
        }
    }

    /// Directory listing through the open handle when there is one.
    fn children(&self, path: &OsStr, fh: u64) -> FuseResult<Vec<Entry>> {
        let listed = match self.tiers.readdir_handle(fh) {
            Ok(entries) => entries,
            Err(_) => self.tiers.readdir(path)?,
        };
        Ok(listed)
    }
}

impl Filesystem for TierFuse {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        debug!(
            "destroy: {} handles still open, {} inodes known",
            self.tiers.open_handles(),
            self.inodes.len()
        );
    }

    async fn lookup(&self, _req: Request, parent: Inode, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child(parent, name)?;
        let meta = self.tiers.getattr(&path)?;
        Ok(self.entry(&path, &meta))
    }

    async fn forget(&self, _req: Request, inode: Inode, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(Inode, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes.forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: Inode,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let meta = match fh.map(|fh| self.tiers.fgetattr(fh)) {
            Some(Ok(meta)) => meta,
            _ => self.tiers.getattr(&self.inodes.path(inode)?)?,
        };
        Ok(ReplyAttr {
            ttl: TTL,
            attr: file_attr(&meta, inode),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: Inode,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.inodes.path(inode)?;
        if let Some(mode) = set_attr.mode {
            self.tiers.chmod(&path, mode)?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.tiers.chown(&path, set_attr.uid, set_attr.gid)?;
        }
        if let Some(size) = set_attr.size {
            match fh {
                Some(fh) => self.tiers.ftruncate(fh, size)?,
                None => self.tiers.truncate(&path, size)?,
            }
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.tiers.utimens(
                &path,
                set_attr.atime.map(time_spec),
                set_attr.mtime.map(time_spec),
            )?;
        }
        let meta = self.tiers.getattr(&path)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: file_attr(&meta, inode),
        })
    }

    async fn readlink(&self, _req: Request, inode: Inode) -> FuseResult<ReplyData> {
        let target = self.tiers.readlink(&self.inodes.path(inode)?)?;
        Ok(Bytes::from(target.into_os_string().into_vec()).into())
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child(parent, name)?;
        let meta = self.tiers.symlink(&path, link)?;
        Ok(self.entry(&path, &meta))
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child(parent, name)?;
        let meta = self.tiers.mknod(&path, mode, rdev)?;
        Ok(self.entry(&path, &meta))
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child(parent, name)?;
        let meta = self.tiers.mkdir(&path, mode)?;
        Ok(self.entry(&path, &meta))
    }

    async fn unlink(&self, _req: Request, parent: Inode, name: &OsStr) -> FuseResult<()> {
        let path = self.inodes.child(parent, name)?;
        self.tiers.unlink(&path)?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: Inode, name: &OsStr) -> FuseResult<()> {
        let path = self.inodes.child(parent, name)?;
        self.tiers.rmdir(&path)?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rename(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        self.rename2(req, parent, name, new_parent, new_name, 0)
            .await
    }

    async fn rename2(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
        flags: u32,
    ) -> FuseResult<()> {
        let from = self.inodes.child(parent, name)?;
        let to = self.inodes.child(new_parent, new_name)?;
        self.tiers.rename(&from, &to, flags)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        inode: Inode,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.inodes.path(inode)?;
        let new_path = self.inodes.child(new_parent, new_name)?;
        let meta = self.tiers.link(&path, &new_path)?;
        Ok(self.entry(&new_path, &meta))
    }

    async fn open(&self, _req: Request, inode: Inode, flags: u32) -> FuseResult<ReplyOpen> {
        let fh = self.tiers.open(&self.inodes.path(inode)?, flags)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self.tiers.read(fh, offset, size)?;
        Ok(Bytes::from(data).into())
    }

    async fn write(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = self.tiers.write(fh, offset, data)?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, inode: Inode) -> FuseResult<ReplyStatFs> {
        let st = self.tiers.statfs(&self.inodes.path(inode)?)?;
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(self.tiers.release(fh)?)
    }

    async fn fsync(&self, _req: Request, _inode: Inode, fh: u64, datasync: bool) -> FuseResult<()> {
        Ok(self.tiers.fsync(fh, datasync)?)
    }

    async fn setxattr(
        &self,
        _req: Request,
        inode: Inode,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> FuseResult<()> {
        if position != 0 {
            return Err(Errno::from(libc::EINVAL));
        }
        let path = self.inodes.path(inode)?;
        Ok(self.tiers.setxattr(&path, name, value, flags)?)
    }

    async fn getxattr(
        &self,
        _req: Request,
        inode: Inode,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        let path = self.inodes.path(inode)?;
        Ok(xattr_reply(self.tiers.getxattr(&path, name, size)?))
    }

    async fn listxattr(&self, _req: Request, inode: Inode, size: u32) -> FuseResult<ReplyXAttr> {
        let path = self.inodes.path(inode)?;
        Ok(xattr_reply(self.tiers.listxattr(&path, size)?))
    }

    async fn removexattr(&self, _req: Request, inode: Inode, name: &OsStr) -> FuseResult<()> {
        let path = self.inodes.path(inode)?;
        Ok(self.tiers.removexattr(&path, name)?)
    }

    async fn flush(&self, _req: Request, _inode: Inode, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(self.tiers.flush(fh)?)
    }

    async fn opendir(&self, _req: Request, inode: Inode, flags: u32) -> FuseResult<ReplyOpen> {
        let fh = self.tiers.opendir(&self.inodes.path(inode)?)?;
        Ok(ReplyOpen { fh, flags })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: Inode,
        fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.inodes.path(parent)?;
        let children = self.children(&path, fh)?;
        let dots = [
            (OsString::from("."), parent, FileType::Directory),
            (OsString::from(".."), self.inodes.parent_of(&path), FileType::Directory),
        ];
        // plain readdir does not hand out lookups
        let rest = children.iter().map(|e| {
            let child = join_virtual(&path, &e.name);
            let ino = self.inodes.peek(&child).unwrap_or(UNKNOWN_INO);
            (e.name.clone(), ino, file_kind(e.meta.file_type()))
        });
        let entries: Vec<FuseResult<DirectoryEntry>> = dots
            .into_iter()
            .chain(rest)
            .enumerate()
            .map(|(i, (name, inode, kind))| {
                Ok(DirectoryEntry {
                    inode,
                    kind,
                    name,
                    offset: i as i64 + 1,
                })
            })
            .skip(offset.max(0) as usize)
            .collect();
        Ok(ReplyDirectory {
            entries: Box::pin(stream::iter(entries)),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: Inode,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.inodes.path(parent)?;
        let dir_meta = self.tiers.getattr(&path)?;
        let children = self.children(&path, fh)?;
        let up = self.inodes.parent_of(&path);
        let listed = [
            (OsString::from("."), dir_meta.clone(), Some(parent)),
            (OsString::from(".."), dir_meta, Some(up)),
        ]
        .into_iter()
        .chain(children.into_iter().map(|e| (e.name, e.meta, None)));
        let entries: Vec<FuseResult<DirectoryEntryPlus>> = listed
            .enumerate()
            .skip(offset as usize)
            .map(|(i, (name, meta, ino))| {
                // the kernel takes a lookup for every child it is handed
                let ino = ino.unwrap_or_else(|| self.inodes.lookup(&join_virtual(&path, &name)));
                let attr = file_attr(&meta, ino);
                Ok(DirectoryEntryPlus {
                    inode: ino,
                    generation: 0,
                    kind: attr.kind,
                    name,
                    offset: i as i64 + 1,
                    attr,
                    entry_ttl: TTL,
                    attr_ttl: TTL,
                })
            })
            .collect();
        Ok(ReplyDirectoryPlus {
            entries: Box::pin(stream::iter(entries)),
        })
    }

    async fn releasedir(&self, _req: Request, _inode: Inode, fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(self.tiers.releasedir(fh)?)
    }

    async fn fsyncdir(&self, _req: Request, _inode: Inode, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, inode: Inode, mask: u32) -> FuseResult<()> {
        Ok(self.tiers.access(&self.inodes.path(inode)?, mask)?)
    }

    async fn create(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.inodes.child(parent, name)?;
        let (fh, meta) = self.tiers.create(&path, mode, flags)?;
        let entry = self.entry(&path, &meta);
        Ok(ReplyCreated {
            ttl: entry.ttl,
            attr: entry.attr,
            generation: entry.generation,
            fh,
            flags: 0,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn xattr_reply(value: XattrValue) -> ReplyXAttr {
    match value {
        XattrValue::Size(len) => ReplyXAttr::Size(len),
        XattrValue::Data(data) => ReplyXAttr::Data(Bytes::from(data)),
    }
}

fn time_spec(t: Timestamp) -> TimeSpec {
    TimeSpec {
        sec: t.sec,
        nsec: t.nsec,
    }
}

pub fn file_kind(kind: StdFileType) -> FileType {
    if kind.is_dir() {
        FileType::Directory
    } else if kind.is_symlink() {
        FileType::Symlink
    } else if kind.is_block_device() {
        FileType::BlockDevice
    } else if kind.is_char_device() {
        FileType::CharDevice
    } else if kind.is_fifo() {
        FileType::NamedPipe
    } else if kind.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

/// Attributes reported to the kernel for the file behind `ino`.
pub fn file_attr(meta: &Metadata, ino: Inode) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: Timestamp::new(meta.atime(), meta.atime_nsec() as u32),
        mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        kind: file_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: meta.blksize() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use futures_util::StreamExt;
    use std::fs;
    use std::os::unix::fs::{PermissionsExt, symlink};

    #[test]
    fn attr_mirrors_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"12345").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
        let attr = file_attr(&fs::metadata(&file).unwrap(), 7);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.nlink, 1);

        let link = dir.path().join("l");
        symlink(&file, &link).unwrap();
        let attr = file_attr(&fs::symlink_metadata(&link).unwrap(), 8);
        assert_eq!(attr.kind, FileType::Symlink);
        let attr = file_attr(&fs::metadata(dir.path()).unwrap(), ROOT_INO);
        assert_eq!(attr.kind, FileType::Directory);
    }

    #[test]
    fn engine_errors_become_errnos() {
        let errno = Errno::from(crate::error::TierError::BadHandle(9));
        let ioerr: std::io::Error = errno.into();
        assert_eq!(ioerr.raw_os_error(), Some(libc::EBADF));
    }

    fn mount(dir: &std::path::Path) -> TierFuse {
        let config = MountConfig::new(dir.join("ssd"), dir.join("hdd"));
        TierFuse::new(TierFs::new(&config).unwrap())
    }

    fn errno_of(err: Errno) -> Option<i32> {
        let ioerr: std::io::Error = err.into();
        ioerr.raw_os_error()
    }

    #[tokio::test]
    async fn create_write_read_through_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let fuse = mount(dir.path());
        let req = Request::default();
        let created = fuse
            .create(req, ROOT_INO, OsStr::new("hello"), 0o644, libc::O_RDWR as u32)
            .await
            .unwrap();
        let ino = created.attr.ino;
        assert_ne!(ino, ROOT_INO);
        let reply = fuse.write(req, ino, created.fh, 0, b"tiered", 0, 0).await.unwrap();
        assert_eq!(reply.written, 6);
        let data = fuse.read(req, ino, created.fh, 2, 16).await.unwrap();
        assert_eq!(&data.data[..], b"ered");
        fuse.release(req, ino, created.fh, 0, 0, false).await.unwrap();

        let entry = fuse.lookup(req, ROOT_INO, OsStr::new("hello")).await.unwrap();
        assert_eq!(entry.attr.ino, ino);
        assert_eq!(entry.attr.size, 6);
        let attr = fuse.getattr(req, ino, None, 0).await.unwrap();
        assert_eq!(attr.attr.size, 6);

        let err = fuse.lookup(req, ROOT_INO, OsStr::new("nope")).await.unwrap_err();
        assert_eq!(errno_of(err), Some(libc::ENOENT));
        let err = fuse.getattr(req, 999, None, 0).await.unwrap_err();
        assert_eq!(errno_of(err), Some(libc::ENOENT));
    }

    #[tokio::test]
    async fn inodes_follow_renames_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let fuse = mount(dir.path());
        let req = Request::default();
        let sub = fuse
            .mkdir(req, ROOT_INO, OsStr::new("d"), 0o755, 0)
            .await
            .unwrap()
            .attr
            .ino;
        let created = fuse
            .create(req, sub, OsStr::new("f"), 0o644, libc::O_RDWR as u32)
            .await
            .unwrap();
        fuse.release(req, created.attr.ino, created.fh, 0, 0, false)
            .await
            .unwrap();

        fuse.rename(req, ROOT_INO, OsStr::new("d"), ROOT_INO, OsStr::new("e"))
            .await
            .unwrap();
        // the file keeps its inode under the new directory name
        assert_eq!(fuse.inodes().path(created.attr.ino).unwrap(), "/e/f");
        let attr = fuse.getattr(req, created.attr.ino, None, 0).await.unwrap();
        assert_eq!(attr.attr.kind, FileType::RegularFile);

        fuse.unlink(req, sub, OsStr::new("f")).await.unwrap();
        assert!(fuse.inodes().path(created.attr.ino).is_err());
        assert!(!dir.path().join("ssd/e/f").exists());

        fuse.forget(req, sub, 2).await;
        fuse.rmdir(req, ROOT_INO, OsStr::new("e")).await.unwrap();
        assert_eq!(fuse.inodes().len(), 1);
    }

    #[tokio::test]
    async fn readdir_lists_dots_then_children() {
        let dir = tempfile::tempdir().unwrap();
        let fuse = mount(dir.path());
        let req = Request::default();
        fs::write(dir.path().join("ssd/a"), b"a").unwrap();
        let fh = fuse.opendir(req, ROOT_INO, 0).await.unwrap().fh;

        let reply = fuse.readdir(req, ROOT_INO, fh, 0).await.unwrap();
        let listed: Vec<(OsString, Inode)> = reply
            .entries
            .map(|e| e.unwrap())
            .map(|e| (e.name, e.inode))
            .collect()
            .await;
        assert_eq!(
            listed,
            vec![
                (OsString::from("."), ROOT_INO),
                (OsString::from(".."), ROOT_INO),
                (OsString::from("a"), UNKNOWN_INO),
            ]
        );

        // resuming after the dots yields only the child
        let reply = fuse.readdir(req, ROOT_INO, fh, 2).await.unwrap();
        let rest: Vec<_> = reply.entries.collect().await;
        assert_eq!(rest.len(), 1);

        fuse.releasedir(req, ROOT_INO, fh, 0).await.unwrap();
        assert_eq!(fuse.tiers().open_handles(), 0);
    }

    #[tokio::test]
    async fn readdirplus_hands_out_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let fuse = mount(dir.path());
        let req = Request::default();
        fs::write(dir.path().join("ssd/a"), b"abc").unwrap();
        let fh = fuse.opendir(req, ROOT_INO, 0).await.unwrap().fh;

        let reply = fuse.readdirplus(req, ROOT_INO, fh, 0, 0).await.unwrap();
        let entries: Vec<DirectoryEntryPlus> = reply.entries.map(|e| e.unwrap()).collect().await;
        assert_eq!(entries.len(), 3);
        let child = &entries[2];
        assert_eq!(child.name, "a");
        assert_eq!(child.attr.size, 3);
        assert_eq!(child.offset, 3);
        assert_eq!(fuse.inodes().peek(OsStr::new("/a")), Some(child.inode));

        // a later lookup reuses the inode
        let entry = fuse.lookup(req, ROOT_INO, OsStr::new("a")).await.unwrap();
        assert_eq!(entry.attr.ino, child.inode);
        fuse.forget(req, child.inode, 1).await;
        assert!(fuse.inodes().path(child.inode).is_ok());
        fuse.batch_forget(req, &[(child.inode, 1)]).await;
        assert!(fuse.inodes().path(child.inode).is_err());

        fuse.releasedir(req, ROOT_INO, fh, 0).await.unwrap();
    }
}
