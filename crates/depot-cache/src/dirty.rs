//! Dirty-marker sentinel protocol.
//!
//! A zero-byte `<folder>.dirty` sibling marks a folder whose last mutation
//! did not run to completion. The marker is flushed to disk before the first
//! destructive step and removed only after the whole step sequence succeeds,
//! so the next reader always finds either a clean tree or explicit evidence
//! of interruption. The marker alone does not exclude concurrent readers;
//! callers needing strict consistency wrap the scope in a write lock.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::warn;

use crate::error::CacheError;
use crate::fsutil;

pub(crate) const DIRTY_SUFFIX: &str = ".dirty";

/// Path of the sentinel guarding `folder`.
#[must_use]
pub fn dirty_marker_path(folder: &Path) -> PathBuf {
    let mut name = folder
        .file_name()
        .map_or_else(|| OsString::from("_"), OsString::from);
    name.push(DIRTY_SUFFIX);
    folder.with_file_name(name)
}

/// Create and durably flush the sentinel. Failing to write it fails the
/// whole operation: proceeding without the marker would leave a crash
/// indistinguishable from a clean state.
pub fn set_dirty(folder: &Path) -> Result<(), CacheError> {
    let marker = dirty_marker_path(folder);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent).map_err(|err| CacheError::storage(parent, err))?;
    }
    let file = File::create(&marker).map_err(|err| CacheError::storage(&marker, err))?;
    file.sync_all()
        .map_err(|err| CacheError::storage(&marker, err))?;
    if let Some(parent) = marker.parent() {
        let _ = fsutil::fsync_dir(parent);
    }
    Ok(())
}

#[must_use]
pub fn is_dirty(folder: &Path) -> bool {
    dirty_marker_path(folder).exists()
}

/// Remove the sentinel after the protected operation fully succeeded.
/// An already-absent marker is success.
pub fn clean_dirty(folder: &Path) -> Result<(), CacheError> {
    let marker = dirty_marker_path(folder);
    match fs::remove_file(&marker) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CacheError::storage(&marker, err)),
    }
}

/// Run `body` inside a dirty scope: the marker is set before the body and
/// cleared only when the body returns `Ok`. On error the marker stays in
/// place and the body's error propagates unchanged.
pub fn with_dirty_scope<T>(folder: &Path, body: impl FnOnce() -> Result<T>) -> Result<T> {
    set_dirty(folder)?;
    match body() {
        Ok(value) => {
            clean_dirty(folder)?;
            Ok(value)
        }
        Err(err) => {
            warn!(folder = %folder.display(), "operation failed inside dirty scope; marker left in place");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn dirty_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let folder = temp.path().join("p");
        fs::create_dir_all(&folder).expect("mkdir");

        set_dirty(&folder).expect("set");
        assert!(is_dirty(&folder));
        clean_dirty(&folder).expect("clean");
        assert!(!is_dirty(&folder));
        clean_dirty(&folder).expect("clean twice is a no-op");
    }

    #[test]
    fn marker_sits_beside_the_folder() {
        let folder = Path::new("/cache/ab12/p/9f86");
        assert_eq!(
            dirty_marker_path(folder),
            Path::new("/cache/ab12/p/9f86.dirty")
        );
    }

    #[test]
    fn scope_clears_marker_on_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let folder = temp.path().join("b");
        fs::create_dir_all(&folder).expect("mkdir");

        let value = with_dirty_scope(&folder, || {
            assert!(is_dirty(&folder), "marker must be set before the body runs");
            Ok(7)
        })
        .expect("scope");
        assert_eq!(value, 7);
        assert!(!is_dirty(&folder));
    }

    #[test]
    fn scope_keeps_marker_on_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let folder = temp.path().join("b");
        fs::create_dir_all(&folder).expect("mkdir");

        let err = with_dirty_scope(&folder, || -> Result<()> { bail!("copy interrupted") })
            .unwrap_err();
        assert_eq!(err.to_string(), "copy interrupted");
        assert!(is_dirty(&folder), "failed scope must leave the marker");
    }

    #[test]
    fn set_dirty_works_for_not_yet_created_folder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let folder = temp.path().join("pkg").join("p");

        set_dirty(&folder).expect("set before folder exists");
        assert!(is_dirty(&folder));
        assert!(!folder.exists());
    }
}
