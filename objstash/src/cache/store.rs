//! Low-level filesystem operations for the cache tree.
//!
//! Everything here returns the underlying `io::Error` untranslated;
//! callers decide what a failure means for the object involved.
//! Extended attributes go through `libc` directly because the create /
//! replace distinction matters for crash recovery.

use crate::cache::codec::filesystem_file_size;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

/// Whether an attribute write must create the key or replace an
/// existing one.  Recovery relies on create-only writes failing when a
/// half-initialised object is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrMode {
    Create,
    Replace,
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// Create an empty regular file.
pub fn create_file(path: &Path) -> io::Result<()> {
    fs::File::create(path)?;
    Ok(())
}

/// Create a directory with the given mode.  An already existing
/// directory is fine.
pub fn create_dir(path: &Path, mode: u32) -> io::Result<()> {
    match fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Set a `user.` namespace extended attribute.
pub fn set_xattr(path: &Path, key: &str, value: &[u8], mode: XattrMode) -> io::Result<()> {
    let path = c_path(path)?;
    let key = CString::new(key)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "attribute key contains NUL"))?;
    let flags = match mode {
        XattrMode::Create => libc::XATTR_CREATE,
        XattrMode::Replace => libc::XATTR_REPLACE,
    };

    #[cfg(target_os = "macos")]
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            key.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
            flags,
        )
    };
    #[cfg(not(target_os = "macos"))]
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            key.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read a `user.` namespace extended attribute, up to `max_len` bytes.
pub fn get_xattr(path: &Path, key: &str, max_len: usize) -> io::Result<Vec<u8>> {
    let path = c_path(path)?;
    let key = CString::new(key)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "attribute key contains NUL"))?;
    let mut buf = vec![0u8; max_len];

    #[cfg(target_os = "macos")]
    let rc = unsafe {
        libc::getxattr(
            path.as_ptr(),
            key.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            0,
        )
    };
    #[cfg(not(target_os = "macos"))]
    let rc = unsafe {
        libc::getxattr(
            path.as_ptr(),
            key.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(rc as usize);
    Ok(buf)
}

/// Write a `u64` attribute value (little endian, eight bytes).
pub fn set_xattr_u64(path: &Path, key: &str, value: u64, mode: XattrMode) -> io::Result<()> {
    set_xattr(path, key, &value.to_le_bytes(), mode)
}

/// Read back a `u64` attribute value.
pub fn get_xattr_u64(path: &Path, key: &str) -> io::Result<u64> {
    let raw = get_xattr(path, key, 8)?;
    let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("attribute {key} has unexpected width"),
        )
    })?;
    Ok(u64::from_le_bytes(bytes))
}

/// Write a `u32` attribute value (little endian, four bytes).
pub fn set_xattr_u32(path: &Path, key: &str, value: u32, mode: XattrMode) -> io::Result<()> {
    set_xattr(path, key, &value.to_le_bytes(), mode)
}

/// Read back a `u32` attribute value.
pub fn get_xattr_u32(path: &Path, key: &str) -> io::Result<u32> {
    let raw = get_xattr(path, key, 4)?;
    let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("attribute {key} has unexpected width"),
        )
    })?;
    Ok(u32::from_le_bytes(bytes))
}

/// Change the permission bits on a file or directory.
pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Remove a regular file.
pub fn unlink(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

/// Remove a directory if it is empty.  A non-empty or already absent
/// directory is not an error.
pub fn remove_dir_if_empty(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(()),
        Err(e) => Err(e),
    }
}

/// fsync a file to make its contents and attributes durable.  The
/// descriptor is closed even when the sync itself fails.
pub fn sync_file(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options.read(true).append(true);
    #[cfg(target_os = "linux")]
    options.custom_flags(libc::O_NOATIME);

    let file = options.open(path)?;
    let result = file.sync_all();
    drop(file);
    result
}

/// Recursively remove a directory tree.  Best effort: an already
/// missing tree is success.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sum the filesystem-accounted size of every entry reachable under
/// `path`: regular files, symlinks and the directories themselves.
pub fn sum_tree(path: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];

    while let Some(current) = stack.pop() {
        let meta = fs::symlink_metadata(&current)?;
        total += filesystem_file_size(meta.len());
        if meta.is_dir() {
            for entry in fs::read_dir(&current)? {
                stack.push(entry?.path());
            }
        }
    }

    Ok(total)
}

/// Write `contents` durably at `path` via a temp file, fsync and
/// rename.  A failed rename removes the temp file.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    fs::write(tmp, contents)?;
    if let Err(e) = sync_file(tmp) {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn xattr_create_then_replace() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("obj");
        create_file(&file).unwrap();

        set_xattr(&file, "user.f", b"name.ext", XattrMode::Create).unwrap();
        assert_eq!(get_xattr(&file, "user.f", 256).unwrap(), b"name.ext");

        // Creating the same key again must fail.
        assert!(set_xattr(&file, "user.f", b"other", XattrMode::Create).is_err());

        set_xattr(&file, "user.f", b"other", XattrMode::Replace).unwrap();
        assert_eq!(get_xattr(&file, "user.f", 256).unwrap(), b"other");
    }

    #[test]
    fn xattr_replace_requires_existing_key() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("obj");
        create_file(&file).unwrap();

        assert!(set_xattr(&file, "user.s", &[0u8; 8], XattrMode::Replace).is_err());
    }

    #[test]
    fn xattr_numeric_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("obj");
        create_file(&file).unwrap();

        set_xattr_u64(&file, "user.s", 123_456, XattrMode::Create).unwrap();
        assert_eq!(get_xattr_u64(&file, "user.s").unwrap(), 123_456);

        set_xattr_u32(&file, "user.w", 1, XattrMode::Create).unwrap();
        assert_eq!(get_xattr_u32(&file, "user.w").unwrap(), 1);
    }

    #[test]
    fn xattr_missing_key_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("obj");
        create_file(&file).unwrap();

        assert!(get_xattr(&file, "user.w", 4).is_err());
    }

    #[test]
    fn remove_dir_if_empty_tolerates_both_cases() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("d");
        create_dir(&dir, 0o770).unwrap();

        // Non-empty: kept, no error.
        create_file(&dir.join("f")).unwrap();
        remove_dir_if_empty(&dir).unwrap();
        assert!(dir.exists());

        // Empty: removed.
        unlink(&dir.join("f")).unwrap();
        remove_dir_if_empty(&dir).unwrap();
        assert!(!dir.exists());

        // Already gone: still fine.
        remove_dir_if_empty(&dir).unwrap();
    }

    #[test]
    fn create_dir_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("d");
        create_dir(&dir, 0o770).unwrap();
        create_dir(&dir, 0o770).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn sum_tree_counts_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("tree");
        create_dir(&root, 0o770).unwrap();
        std::fs::write(root.join("a"), vec![0u8; 5000]).unwrap();
        create_dir(&root.join("sub"), 0o770).unwrap();
        std::fs::write(root.join("sub").join("b"), vec![0u8; 100]).unwrap();

        // a: ceil(5000/4096)+1 = 3 blocks; b: 2 blocks; each directory
        // accounts for its own stat size as well.
        let total = sum_tree(&root).unwrap();
        let files = filesystem_file_size(5000) + filesystem_file_size(100);
        let root_md = std::fs::symlink_metadata(&root).unwrap().len();
        let sub_md = std::fs::symlink_metadata(root.join("sub")).unwrap().len();
        let dirs = filesystem_file_size(root_md) + filesystem_file_size(sub_md);
        assert_eq!(total, files + dirs);
    }

    #[test]
    fn sync_file_missing_path_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(sync_file(&tmp.path().join("absent")).is_err());
    }

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("seq");

        write_atomic(&target, "1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "1\n");

        write_atomic(&target, "1001\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "1001\n");
        assert!(!tmp.path().join("seq.tmp").exists());
    }

    #[test]
    fn chmod_flips_write_permission() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("obj");
        create_file(&file).unwrap();

        chmod(&file, 0o440).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o440);

        chmod(&file, 0o660).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[test]
    fn remove_tree_on_missing_path_is_ok() {
        let tmp = TempDir::new().unwrap();
        remove_tree(&tmp.path().join("nope")).unwrap();
    }
}
