use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use depot_domain::RecipeReference;

use super::{
    DOWNLOAD_FOLDER, EXPORT_FOLDER, EXPORT_SOURCES_FOLDER, METADATA_FOLDER, RECIPE_DATA_FILENAME,
    RECIPE_FILENAME, SOURCE_FOLDER,
};
use crate::error::CacheError;
use crate::fsutil;
use crate::lock::{LockGuard, Locker};
use crate::manifest::Manifest;

/// Layout of one recipe revision inside the cache.
///
/// `canonical` is the addressed location under the cache root; `base` is the
/// real folder after short-path resolution (identical when the entry is not
/// shortened). Both are fixed at construction and never change for the
/// lifetime of the layout; only the attached reference may still gain its
/// revision after export. All sub-folder accessors are pure path
/// composition: nothing is created or checked until a caller writes into
/// them.
#[derive(Clone)]
pub struct RecipeLayout {
    reference: RecipeReference,
    canonical: PathBuf,
    base: PathBuf,
    locker: Arc<dyn Locker>,
}

impl fmt::Debug for RecipeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeLayout")
            .field("reference", &self.reference.to_string())
            .field("canonical", &self.canonical)
            .field("base", &self.base)
            .finish()
    }
}

impl RecipeLayout {
    pub(crate) fn new(
        reference: RecipeReference,
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
    pub fn reference(&self) -> &RecipeReference {
        &self.reference
    }

    #[must_use]
    pub fn base_folder(&self) -> &Path {
        &self.base
    }

    #[must_use]
    pub fn export(&self) -> PathBuf {
        self.base.join(EXPORT_FOLDER)
    }

    #[must_use]
    pub fn export_sources(&self) -> PathBuf {
        self.base.join(EXPORT_SOURCES_FOLDER)
    }

    #[must_use]
    pub fn source(&self) -> PathBuf {
        self.base.join(SOURCE_FOLDER)
    }

    #[must_use]
    pub fn download_staging(&self) -> PathBuf {
        self.base.join(DOWNLOAD_FOLDER)
    }

    #[must_use]
    pub fn metadata(&self) -> PathBuf {
        self.base.join(METADATA_FOLDER)
    }

    #[must_use]
    pub fn recipe_file(&self) -> PathBuf {
        self.export().join(RECIPE_FILENAME)
    }

    #[must_use]
    pub fn recipe_data_file(&self) -> PathBuf {
        self.export().join(RECIPE_DATA_FILENAME)
    }

    /// Load the manifest recorded at export time and recompute a fresh one
    /// from the export and export-sources trees. Equal pair means the stored
    /// recipe is intact; an unequal pair means either a legitimate edit
    /// awaiting re-export or corruption, which the caller tells apart from
    /// revision state.
    pub fn recipe_manifests(&self) -> Result<(Manifest, Manifest)> {
        let recorded = Manifest::load(&self.export())?;
        let expected = Manifest::compute_from(&[&self.export(), &self.export_sources()])?;
        Ok((recorded, expected))
    }

    /// Serialize recipe export against other writers of this revision. The
    /// lock is keyed on the canonical location so every process agrees on it
    /// regardless of short-path resolution.
    pub fn write_lock(&self, timeout: Duration) -> Result<LockGuard, CacheError> {
        self.locker.write_lock(&self.canonical, timeout)
    }

    pub fn read_lock(&self, timeout: Duration) -> Result<LockGuard, CacheError> {
        self.locker.read_lock(&self.canonical, timeout)
    }

    /// Delete the fetched source tree so it is re-fetched next time.
    pub fn sources_remove(&self) -> Result<(), CacheError> {
        fsutil::remove_tree(&self.source())
    }

    /// Delete the whole revision tree, the short-path target included when
    /// the entry was relocated. Absent folders are success.
    pub fn remove(&self) -> Result<(), CacheError> {
        fsutil::remove_tree(&self.base)?;
        if self.canonical != self.base {
            fsutil::remove_tree(&self.canonical)?;
        }
        Ok(())
    }
}
