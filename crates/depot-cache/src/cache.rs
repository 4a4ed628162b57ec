//! Cache facade: resolves references to folders and hands out layouts.
//!
//! Storage is allocated before identity is fully known: a new export writes
//! into an anonymous staging folder, and binding the computed revision
//! publishes it with a single rename to the revision-addressed name. Readers
//! therefore never observe a half-identified layout; the `latest` pointer is
//! only updated after the rename lands.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

use depot_domain::{PackageReference, RecipeReference};

use crate::address::{self, ContentAddresser, PACKAGES_SUBDIR, SHORT_LINK_FILENAME};
use crate::error::CacheError;
use crate::fsutil;
use crate::layout::{BasicLayout, PackageLayout, RecipeLayout, RECIPE_FILENAME};
use crate::lock::{FileLocker, LockGuard, Locker, NoopLocker};

const STAGING_PREFIX: &str = "_staging-";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const STALE_STAGING_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Which lock implementation the cache hands to its layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Advisory cross-process file locks.
    CrossProcess,
    /// No-op guards for single-process or trusted pipelines.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub short_paths: bool,
    pub short_root: Option<PathBuf>,
    pub lock_policy: LockPolicy,
    /// When set, a dirty package found by a safe get is removed so the
    /// caller rebuilds it; otherwise the get fails loudly.
    pub auto_repair: bool,
    pub lock_timeout: Duration,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            short_paths: cfg!(windows),
            short_root: None,
            lock_policy: LockPolicy::CrossProcess,
            auto_repair: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Home layout: `~/.depot/cache` and `~/.depot/short`, overridable via
    /// `DEPOT_HOME` (whole home) and `DEPOT_SHORT_HOME` (short root only).
    pub fn from_env() -> Result<Self> {
        let home = match env::var_os("DEPOT_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs_next::home_dir()
                .context("failed to resolve HOME for the depot cache")?
                .join(".depot"),
        };
        let short_root = match env::var_os("DEPOT_SHORT_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => home.join("short"),
        };
        let mut config = Self::new(home.join("cache"));
        config.short_root = Some(short_root);
        Ok(config)
    }
}

/// Local package cache: maps references to on-disk layouts and coordinates
/// concurrent access to them.
pub struct DepotCache {
    config: CacheConfig,
    addresser: ContentAddresser,
    locker: Arc<dyn Locker>,
}

impl std::fmt::Debug for DepotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepotCache")
            .field("root", &self.config.root)
            .field("short_paths", &self.config.short_paths)
            .field("lock_policy", &self.config.lock_policy)
            .finish()
    }
}

impl DepotCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)
            .with_context(|| format!("failed to create cache root {}", config.root.display()))?;
        let locker: Arc<dyn Locker> = match config.lock_policy {
            LockPolicy::CrossProcess => Arc::new(FileLocker),
            LockPolicy::Disabled => Arc::new(NoopLocker),
        };
        let cache = Self {
            config,
            addresser: ContentAddresser,
            locker,
        };
        // Best-effort cleanup of leftover staging folders to keep the cache tidy.
        let _ = cache.sweep_stale_staging();
        Ok(cache)
    }

    /// Sweep staging folders left behind by interrupted exports. Only
    /// folders older than a day are touched so a concurrent export's
    /// staging area is never pulled out from under it.
    pub fn sweep_stale_staging(&self) -> Result<u64> {
        let mut removed = 0;
        let now = SystemTime::now();
        for entry in WalkDir::new(&self.config.root)
            .min_depth(1)
            .max_depth(5)
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() < STALE_STAGING_MAX_AGE {
                continue;
            }
            remove_addressed_tree(entry.path())?;
            removed += 1;
        }
        Ok(removed)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn short_root(&self) -> PathBuf {
        self.config.short_root.clone().unwrap_or_else(|| {
            self.config
                .root
                .parent()
                .unwrap_or(&self.config.root)
                .join("short")
        })
    }

    fn recipe_base_dir(&self, reference: &RecipeReference) -> Result<PathBuf, CacheError> {
        Ok(self
            .config
            .root
            .join(self.addresser.recipe_base_folder(reference)?))
    }

    /// Fill in the revision when the caller did not pin one, using the
    /// latest pointer beside the revision folders.
    fn resolved_recipe(&self, reference: &RecipeReference) -> Result<RecipeReference, CacheError> {
        if reference.revision.is_some() {
            reference.validate()?;
            return Ok(reference.clone());
        }
        let base = self.recipe_base_dir(reference)?;
        let latest =
            address::read_latest_pointer(&base).ok_or_else(|| CacheError::MissingEntry {
                reference: reference.to_string(),
                reason: "no revision in cache",
            })?;
        Ok(reference.with_revision(latest))
    }

    /// Layout of an existing recipe revision (the latest one when the
    /// reference carries no revision).
    pub fn recipe_layout(&self, reference: &RecipeReference) -> Result<RecipeLayout> {
        let resolved = self.resolved_recipe(reference)?;
        let canonical = self
            .config
            .root
            .join(self.addresser.recipe_revision_folder(&resolved)?);
        if !canonical.is_dir() {
            return Err(CacheError::MissingEntry {
                reference: resolved.to_string(),
                reason: "revision folder not found",
            }
            .into());
        }
        let base = address::resolve_short_path(&canonical)?;
        debug!(reference = %resolved, base = %base.display(), "recipe layout resolved");
        Ok(RecipeLayout::new(
            resolved,
            canonical,
            base,
            self.locker.clone(),
        ))
    }

    /// Allocate storage for a new export before its revision is known. The
    /// returned layout writes into an anonymous staging folder (relocated
    /// under the short root when short paths are enabled) until
    /// [`Self::bind_recipe_revision`] publishes it.
    pub fn create_recipe_layout(&self, reference: &RecipeReference) -> Result<RecipeLayout> {
        reference.validate().map_err(CacheError::from)?;
        let base_dir = self.recipe_base_dir(reference)?;
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create {}", base_dir.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&base_dir)
            .with_context(|| format!("failed to stage under {}", base_dir.display()))?
            .keep();
        let base = if self.config.short_paths {
            address::shorten_folder(&staging, &self.short_root())?
        } else {
            staging.clone()
        };
        debug!(reference = %reference, staging = %staging.display(), "staged recipe layout");
        Ok(RecipeLayout::new(
            reference.clone(),
            staging,
            base,
            self.locker.clone(),
        ))
    }

    /// Publish a staged export under its computed revision. If the revision
    /// already exists the staging folder is discarded and the existing
    /// layout returned; either way the `latest` pointer is refreshed.
    pub fn bind_recipe_revision(
        &self,
        layout: RecipeLayout,
        revision: &str,
    ) -> Result<RecipeLayout> {
        let bound = layout.reference().with_revision(revision);
        bound.validate().map_err(CacheError::from)?;
        let staging = layout.canonical_folder().to_path_buf();
        let base_dir = staging
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| CacheError::MissingEntry {
                reference: bound.to_string(),
                reason: "staging folder has no parent",
            })?;
        let target = base_dir.join(revision);

        if target.is_dir() {
            debug!(reference = %bound, "revision already in cache; discarding staging");
            layout.remove()?;
        } else {
            fs::rename(&staging, &target).with_context(|| {
                format!(
                    "failed to publish staging folder ({} -> {})",
                    staging.display(),
                    target.display()
                )
            })?;
            let _ = fsutil::fsync_dir(&base_dir);
        }
        address::write_latest_pointer(&base_dir, revision)?;

        let base = address::resolve_short_path(&target)?;
        Ok(RecipeLayout::new(bound, target, base, self.locker.clone()))
    }

    fn package_base_dir(&self, recipe_layout: &RecipeLayout, package_id: &str) -> PathBuf {
        recipe_layout
            .base_folder()
            .join(PACKAGES_SUBDIR)
            .join(package_id)
    }

    /// Layout of an existing package revision (the latest one when the
    /// reference carries no package revision).
    pub fn package_layout(&self, reference: &PackageReference) -> Result<PackageLayout> {
        reference.validate().map_err(CacheError::from)?;
        let recipe = self.recipe_layout(&reference.recipe)?;
        let pkg_base = self.package_base_dir(&recipe, &reference.package_id);
        let revision = match &reference.revision {
            Some(revision) => revision.clone(),
            None => address::read_latest_pointer(&pkg_base).ok_or_else(|| {
                CacheError::MissingEntry {
                    reference: reference.to_string(),
                    reason: "no package revision in cache",
                }
            })?,
        };
        let canonical = pkg_base.join(&revision);
        let mut resolved = reference.with_revision(revision);
        resolved.recipe = recipe.reference().clone();
        if !canonical.is_dir() {
            return Err(CacheError::MissingEntry {
                reference: resolved.to_string(),
                reason: "package revision folder not found",
            }
            .into());
        }
        let base = address::resolve_short_path(&canonical)?;
        debug!(reference = %resolved, base = %base.display(), "package layout resolved");
        Ok(PackageLayout::new(
            resolved,
            canonical,
            base,
            self.locker.clone(),
        ))
    }

    /// Allocate storage for a package build/download before its revision is
    /// known; publish with [`Self::bind_package_revision`].
    pub fn create_package_layout(&self, reference: &PackageReference) -> Result<PackageLayout> {
        reference.validate().map_err(CacheError::from)?;
        let recipe = self.recipe_layout(&reference.recipe)?;
        let pkg_base = self.package_base_dir(&recipe, &reference.package_id);
        fs::create_dir_all(&pkg_base)
            .with_context(|| format!("failed to create {}", pkg_base.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&pkg_base)
            .with_context(|| format!("failed to stage under {}", pkg_base.display()))?
            .keep();
        let base = if self.config.short_paths {
            address::shorten_folder(&staging, &self.short_root())?
        } else {
            staging.clone()
        };
        debug!(reference = %reference, staging = %staging.display(), "staged package layout");
        let resolved = PackageReference {
            recipe: recipe.reference().clone(),
            package_id: reference.package_id.clone(),
            revision: None,
        };
        Ok(PackageLayout::new(
            resolved,
            staging,
            base,
            self.locker.clone(),
        ))
    }

    /// Publish a staged package under its computed package revision.
    pub fn bind_package_revision(
        &self,
        layout: PackageLayout,
        revision: &str,
    ) -> Result<PackageLayout> {
        let bound = layout.reference().with_revision(revision);
        bound.validate().map_err(CacheError::from)?;
        let staging = layout.canonical_folder().to_path_buf();
        let pkg_base = staging
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| CacheError::MissingEntry {
                reference: bound.to_string(),
                reason: "staging folder has no parent",
            })?;
        let target = pkg_base.join(revision);

        if target.is_dir() {
            debug!(reference = %bound, "package revision already in cache; discarding staging");
            layout.remove()?;
        } else {
            fs::rename(&staging, &target).with_context(|| {
                format!(
                    "failed to publish staging folder ({} -> {})",
                    staging.display(),
                    target.display()
                )
            })?;
            let _ = fsutil::fsync_dir(&pkg_base);
        }
        address::write_latest_pointer(&pkg_base, revision)?;

        let base = address::resolve_short_path(&target)?;
        Ok(PackageLayout::new(bound, target, base, self.locker.clone()))
    }

    /// Safe get of the packaged-artifacts folder: a dirty package is never
    /// served. With auto-repair enabled the stale tree is removed and the
    /// entry reported missing so the caller rebuilds; otherwise the get
    /// fails naming the corrupted folder.
    pub fn get_package_folder(&self, reference: &PackageReference) -> Result<PathBuf> {
        let layout = self.package_layout(reference)?;
        if layout.package_is_dirty() {
            if self.config.auto_repair {
                warn!(reference = %layout.reference(), folder = %layout.package().display(),
                    "removing dirty package");
                layout.remove()?;
                return Err(CacheError::MissingEntry {
                    reference: layout.reference().to_string(),
                    reason: "dirty package removed; rebuild required",
                }
                .into());
            }
            return Err(CacheError::CorruptedCache {
                path: layout.package(),
            }
            .into());
        }
        Ok(layout.package())
    }

    /// Build folder for a package revision; no dirty check, the build step
    /// owns whatever it finds there.
    pub fn get_build_folder(&self, reference: &PackageReference) -> Result<PathBuf> {
        Ok(self.package_layout(reference)?.build())
    }

    /// Scoped read lock over one recipe revision's tree.
    pub fn read_lock(&self, reference: &RecipeReference) -> Result<LockGuard> {
        let resolved = self.resolved_recipe(reference)?;
        let canonical = self
            .config
            .root
            .join(self.addresser.recipe_revision_folder(&resolved)?);
        self.locker
            .read_lock(&canonical, self.config.lock_timeout)
            .map_err(Into::into)
    }

    /// Scoped write lock over one recipe revision's tree.
    pub fn write_lock(&self, reference: &RecipeReference) -> Result<LockGuard> {
        let resolved = self.resolved_recipe(reference)?;
        let canonical = self
            .config
            .root
            .join(self.addresser.recipe_revision_folder(&resolved)?);
        self.locker
            .write_lock(&canonical, self.config.lock_timeout)
            .map_err(Into::into)
    }

    /// Remove one revision (when pinned) or every revision of a recipe.
    /// Already-absent entries are success.
    pub fn remove_recipe(&self, reference: &RecipeReference) -> Result<()> {
        reference.validate().map_err(CacheError::from)?;
        let base = self.recipe_base_dir(reference)?;
        if !base.exists() {
            return Ok(());
        }
        if let Some(revision) = &reference.revision {
            remove_addressed_tree(&base.join(revision))?;
            drop_latest_pointer_if(&base, revision);
            if list_revision_dirs(&base).is_empty() {
                fsutil::remove_tree(&base)?;
            }
        } else {
            for revision in list_revision_dirs(&base) {
                remove_addressed_tree(&base.join(revision))?;
            }
            fsutil::remove_tree(&base)?;
        }
        debug!(reference = %reference, "recipe removed");
        Ok(())
    }

    /// Remove one package revision (when pinned) or every revision of a
    /// package-id. Already-absent entries are success.
    pub fn remove_package(&self, reference: &PackageReference) -> Result<()> {
        reference.validate().map_err(CacheError::from)?;
        let recipe = match self.recipe_layout(&reference.recipe) {
            Ok(layout) => layout,
            Err(err) => {
                return match err.downcast_ref::<CacheError>() {
                    Some(CacheError::MissingEntry { .. }) => Ok(()),
                    _ => Err(err),
                };
            }
        };
        let pkg_base = self.package_base_dir(&recipe, &reference.package_id);
        if !pkg_base.exists() {
            return Ok(());
        }
        if let Some(revision) = &reference.revision {
            remove_addressed_tree(&pkg_base.join(revision))?;
            crate::dirty::clean_dirty(&pkg_base.join(revision))?;
            drop_latest_pointer_if(&pkg_base, revision);
            if list_revision_dirs(&pkg_base).is_empty() {
                fsutil::remove_tree(&pkg_base)?;
            }
        } else {
            for revision in list_revision_dirs(&pkg_base) {
                remove_addressed_tree(&pkg_base.join(revision))?;
            }
            fsutil::remove_tree(&pkg_base)?;
        }
        debug!(reference = %reference, "package removed");
        Ok(())
    }

    /// Revisions currently stored for a recipe, sorted.
    pub fn list_revisions(&self, reference: &RecipeReference) -> Result<Vec<String>> {
        let base = self.recipe_base_dir(reference)?;
        let mut revisions = list_revision_dirs(&base);
        revisions.sort();
        Ok(revisions)
    }

    /// Layout for an editable reference resolved to an external working
    /// copy; nothing is copied into the cache.
    #[must_use]
    pub fn editable_layout(&self, project_dir: &Path) -> BasicLayout {
        let recipe_file = project_dir.join(RECIPE_FILENAME);
        let recipe_file = recipe_file.is_file().then_some(recipe_file);
        BasicLayout::new(project_dir.to_path_buf(), recipe_file)
    }
}

/// Remove an addressed folder tree together with every short-path target
/// reachable from link sentinels inside it. Targets are themselves swept
/// for nested links (a relocated recipe revision holds the links of its
/// relocated packages). A broken link only loses its canonical side;
/// eviction stays idempotent.
fn remove_addressed_tree(canonical: &Path) -> Result<(), CacheError> {
    if canonical.exists() {
        for entry in WalkDir::new(canonical).into_iter().flatten() {
            if entry.file_type().is_file() && entry.file_name() == SHORT_LINK_FILENAME {
                if let Ok(target) = address::resolve_short_path(
                    entry.path().parent().unwrap_or(canonical),
                ) {
                    remove_addressed_tree(&target)?;
                }
            }
        }
    }
    fsutil::remove_tree(canonical)
}

fn list_revision_dirs(base: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(base) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('_'))
        .collect()
}

fn drop_latest_pointer_if(base: &Path, revision: &str) {
    let pointer = base.join(address::LATEST_POINTER_FILENAME);
    let points_here = fs::read_to_string(&pointer)
        .map(|text| text.trim() == revision)
        .unwrap_or(false);
    if points_here {
        let _ = fs::remove_file(&pointer);
    }
}
