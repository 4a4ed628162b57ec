use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use depot_domain::PackageReference;

use super::{BUILD_FOLDER, DOWNLOAD_FOLDER, FINALIZE_FOLDER, METADATA_FOLDER};
use crate::dirty;
use crate::error::CacheError;
use crate::fsutil;
use crate::lock::{LockGuard, Locker};
use crate::manifest::Manifest;

const PACKAGE_FOLDER: &str = "p";

/// Layout of one package revision (one package-id under a recipe revision).
///
/// As with recipes, `canonical` is the addressed location and `base` the
/// short-path-resolved real folder; both are fixed at construction.
#[derive(Clone)]
pub struct PackageLayout {
    reference: PackageReference,
    canonical: PathBuf,
    base: PathBuf,
    locker: Arc<dyn Locker>,
}

impl fmt::Debug for PackageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageLayout")
            .field("reference", &self.reference.to_string())
            .field("canonical", &self.canonical)
            .field("base", &self.base)
            .finish()
    }
}

impl PackageLayout {
    pub(crate) fn new(
        reference: PackageReference,
        canonical: PathBuf,
        base: PathBuf,
        locker: Arc<dyn Locker>,
    ) -> Self {
        Self {
            reference,
            canonical,
            base,
            locker,
        }
    }

    pub(crate) fn canonical_folder(&self) -> &Path {
        &self.canonical
    }

    #[must_use]
    pub fn reference(&self) -> &PackageReference {
        &self.reference
    }

    #[must_use]
    pub fn base_folder(&self) -> &Path {
        &self.base
    }

    #[must_use]
    pub fn build(&self) -> PathBuf {
        self.base.join(BUILD_FOLDER)
    }

    #[must_use]
    pub fn package(&self) -> PathBuf {
        self.base.join(PACKAGE_FOLDER)
    }

    #[must_use]
    pub fn finalize(&self) -> PathBuf {
        self.base.join(FINALIZE_FOLDER)
    }

    #[must_use]
    pub fn download_staging(&self) -> PathBuf {
        self.base.join(DOWNLOAD_FOLDER)
    }

    #[must_use]
    pub fn metadata(&self) -> PathBuf {
        self.base.join(METADATA_FOLDER)
    }

    /// Recorded vs freshly computed manifest of the packaged artifacts.
    pub fn package_manifests(&self) -> Result<(Manifest, Manifest)> {
        let recorded = Manifest::load(&self.package())?;
        let expected = Manifest::compute_from(&[&self.package()])?;
        Ok((recorded, expected))
    }

    /// Run a package-folder mutation (build output copy, tarball extraction)
    /// inside a dirty scope: interruption leaves the marker for the next
    /// reader, success clears it.
    pub fn with_package_dirty_scope<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        dirty::with_dirty_scope(&self.package(), body)
    }

    /// True when the last mutation of the package folder did not complete.
    #[must_use]
    pub fn package_is_dirty(&self) -> bool {
        dirty::is_dirty(&self.package())
    }

    pub fn write_lock(&self, timeout: Duration) -> Result<LockGuard, CacheError> {
        self.locker.write_lock(&self.canonical, timeout)
    }

    pub fn read_lock(&self, timeout: Duration) -> Result<LockGuard, CacheError> {
        self.locker.read_lock(&self.canonical, timeout)
    }

    /// Delete the build tree.
    pub fn build_remove(&self) -> Result<(), CacheError> {
        fsutil::remove_tree(&self.build())
    }

    /// Delete the packaged artifacts, clearing any residual dirty marker
    /// even when the folder itself is already gone: a marker must never
    /// outlive its target.
    pub fn package_remove(&self) -> Result<(), CacheError> {
        fsutil::remove_tree(&self.package())?;
        dirty::clean_dirty(&self.package())
    }

    /// Delete the whole package revision tree, marker and short-path target
    /// included.
    pub fn remove(&self) -> Result<(), CacheError> {
        fsutil::remove_tree(&self.base)?;
        if self.canonical != self.base {
            fsutil::remove_tree(&self.canonical)?;
        }
        dirty::clean_dirty(&self.package())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NoopLocker;
    use anyhow::bail;
    use depot_domain::RecipeReference;
    use std::fs;

    fn layout(base: &Path) -> PackageLayout {
        let recipe = RecipeReference::new("zlib", "1.3").with_revision("aa11");
        let reference = PackageReference::new(recipe, "9f86d081").with_revision("bb22");
        PackageLayout::new(
            reference,
            base.to_path_buf(),
            base.to_path_buf(),
            Arc::new(NoopLocker),
        )
    }

    #[test]
    fn composes_role_subfolders_without_io() {
        let base = Path::new("/cache/zlib-0123456789ab/aa11/p/9f86d081/bb22");
        let layout = layout(base);
        assert_eq!(layout.build(), base.join("b"));
        assert_eq!(layout.package(), base.join("p"));
        assert_eq!(layout.finalize(), base.join("f"));
        assert_eq!(layout.download_staging(), base.join("d"));
        assert_eq!(layout.metadata(), base.join("metadata"));
    }

    #[test]
    fn dirty_scope_marks_interrupted_packaging() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout(temp.path());

        let err = layout
            .with_package_dirty_scope(|| -> Result<()> {
                fs::create_dir_all(layout.package()).expect("mkdir");
                fs::write(layout.package().join("lib.a"), b"half").expect("write");
                bail!("extraction interrupted")
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "extraction interrupted");
        assert!(layout.package_is_dirty());

        layout
            .with_package_dirty_scope(|| {
                fs::write(layout.package().join("lib.a"), b"whole").expect("write");
                Ok(())
            })
            .expect("clean run");
        assert!(!layout.package_is_dirty());
    }

    #[test]
    fn package_remove_clears_residual_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout(temp.path());

        // Marker without a folder: crash before anything was written.
        dirty::set_dirty(&layout.package()).expect("mark");
        assert!(!layout.package().exists());
        layout.package_remove().expect("remove");
        assert!(!layout.package_is_dirty());
    }

    #[test]
    fn build_remove_leaves_package_intact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout(temp.path());
        fs::create_dir_all(layout.build()).expect("mkdir");
        fs::create_dir_all(layout.package()).expect("mkdir");
        fs::write(layout.package().join("lib.a"), b"bytes").expect("write");

        layout.build_remove().expect("remove build");
        assert!(!layout.build().exists());
        assert!(layout.package().join("lib.a").exists());
    }

    #[test]
    fn package_manifests_detect_tampering() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout(temp.path());
        fs::create_dir_all(layout.package()).expect("mkdir");
        fs::write(layout.package().join("lib.a"), b"bytes").expect("write");
        Manifest::compute_from(&[&layout.package()])
            .expect("compute")
            .save(&layout.package())
            .expect("save");

        let (recorded, expected) = layout.package_manifests().expect("manifests");
        assert_eq!(recorded, expected);

        fs::write(layout.package().join("lib.a"), b"tampered").expect("tamper");
        let (recorded, expected) = layout.package_manifests().expect("manifests");
        assert_ne!(recorded, expected);
    }
}
