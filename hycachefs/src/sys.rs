//! Thin wrappers over the native calls std does not expose. Timestamps and
//! renames go through nix; extended attributes through libc.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
use nix::fcntl::{RenameFlags, renameat2};
use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::time::TimeSpec as NixTimeSpec;

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes.to_vec()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    cstring(path.as_os_str().as_bytes())
}

fn check(res: libc::c_int) -> io::Result<()> {
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check_size(res: libc::ssize_t) -> io::Result<usize> {
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// A timestamp to apply, or `None` to leave it alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: u32,
}

impl TimeSpec {
    fn native(this: Option<Self>) -> NixTimeSpec {
        this.map(|t| NixTimeSpec::new(t.sec as libc::time_t, t.nsec as _))
            .unwrap_or(NixTimeSpec::UTIME_OMIT)
    }
}

/// utimensat(2) without following a final symlink.
pub fn set_times(path: &Path, atime: Option<TimeSpec>, mtime: Option<TimeSpec>) -> io::Result<()> {
    utimensat(
        None,
        path,
        &TimeSpec::native(atime),
        &TimeSpec::native(mtime),
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(io::Error::from)
}

/// rename(2), or renameat2(2) with `RENAME_NOREPLACE` when `noreplace` is
/// set so an existing target fails with `EEXIST` atomically.
pub fn rename(from: &Path, to: &Path, noreplace: bool) -> io::Result<()> {
    if !noreplace {
        return std::fs::rename(from, to);
    }
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        renameat2(None, from, None, to, RenameFlags::RENAME_NOREPLACE).map_err(io::Error::from)
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        if to.symlink_metadata().is_ok() {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        std::fs::rename(from, to)
    }
}

pub fn set_xattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    let c_path = path_cstring(path)?;
    let c_name = cstring(name.as_bytes())?;
    check(unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    })
}

/// With `size == 0` only the value length is queried.
pub fn get_xattr(path: &Path, name: &OsStr, size: usize) -> io::Result<XattrValue> {
    let c_path = path_cstring(path)?;
    let c_name = cstring(name.as_bytes())?;
    if size == 0 {
        let len = check_size(unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        })?;
        return Ok(XattrValue::Size(len as u32));
    }
    let mut buf = vec![0u8; size];
    let len = check_size(unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    })?;
    buf.truncate(len);
    Ok(XattrValue::Data(buf))
}

/// NUL-separated attribute names, or their total length when `size == 0`.
pub fn list_xattr(path: &Path, size: usize) -> io::Result<XattrValue> {
    let c_path = path_cstring(path)?;
    if size == 0 {
        let len = check_size(unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) })?;
        return Ok(XattrValue::Size(len as u32));
    }
    let mut buf = vec![0u8; size];
    let len = check_size(unsafe {
        libc::llistxattr(
            c_path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    })?;
    buf.truncate(len);
    Ok(XattrValue::Data(buf))
}

pub fn remove_xattr(path: &Path, name: &OsStr) -> io::Result<()> {
    let c_path = path_cstring(path)?;
    let c_name = cstring(name.as_bytes())?;
    check(unsafe { libc::lremovexattr(c_path.as_ptr(), c_name.as_ptr()) })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XattrValue {
    Size(u32),
    Data(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn set_times_only_touches_requested_fields() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        set_times(
            &file,
            Some(TimeSpec { sec: 1000, nsec: 0 }),
            Some(TimeSpec { sec: 2000, nsec: 5 }),
        )
        .unwrap();
        set_times(&file, None, None).unwrap();
        let meta = fs::metadata(&file).unwrap();
        assert_eq!(meta.atime(), 1000);
        assert_eq!(meta.mtime(), 2000);
        assert_eq!(meta.mtime_nsec(), 5);
    }

    #[test]
    fn rename_noreplace_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();
        let err = rename(&a, &b, true).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        assert_eq!(fs::read(&b).unwrap(), b"b");
        rename(&a, &b, false).unwrap();
        assert_eq!(fs::read(&b).unwrap(), b"a");
        assert!(!a.exists());
    }

    #[test]
    fn missing_xattr_reports_errno() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let err = get_xattr(&file, OsStr::new("user.absent"), 0).unwrap_err();
        assert!(matches!(
            err.raw_os_error(),
            Some(libc::ENODATA) | Some(libc::ENOTSUP)
        ));
    }
}
