use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::Path;

use crate::error::CacheError;

/// Best-effort recursive chmod for trees that may have been hardened
/// read-only before a delete.
#[cfg(unix)]
pub(crate) fn make_writable_recursive(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        return;
    }
    let mode = if meta.is_dir() { 0o755 } else { 0o644 };
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                make_writable_recursive(&entry.path());
            }
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn make_writable_recursive(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        return;
    }
    let mut perms = meta.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        let _ = fs::set_permissions(path, perms);
    }
    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                make_writable_recursive(&entry.path());
            }
        }
    }
}

/// Remove a file or directory tree. An already-absent target is success;
/// symlinks are removed without following; any other OS failure surfaces as
/// a storage error with the path preserved.
pub(crate) fn remove_tree(path: &Path) -> Result<(), CacheError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(CacheError::storage(path, err)),
    };
    if meta.file_type().is_symlink() || meta.is_file() {
        return match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::storage(path, err)),
        };
    }
    make_writable_recursive(path);
    fs::remove_dir_all(path).map_err(|err| CacheError::storage(path, err))
}

/// Flush directory metadata so renames and unlinks in it become durable.
pub(crate) fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    let file = File::open(dir)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_tree_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("tree");
        fs::create_dir_all(target.join("nested")).expect("mkdir");
        fs::write(target.join("nested/file.txt"), b"x").expect("write");

        remove_tree(&target).expect("first remove");
        assert!(!target.exists());
        remove_tree(&target).expect("second remove is a no-op");
    }

    #[cfg(unix)]
    #[test]
    fn remove_tree_handles_read_only_children() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("tree");
        let nested = target.join("nested");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(nested.join("file.txt"), b"x").expect("write");
        fs::set_permissions(&nested, fs::Permissions::from_mode(0o555)).expect("chmod");

        remove_tree(&target).expect("remove read-only tree");
        assert!(!target.exists());
    }
}
