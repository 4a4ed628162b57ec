//! Deterministic folder addressing for references.
//!
//! A recipe maps to a single length-stable folder derived from its full
//! identity (a truncated name for readability plus a sha256 token for
//! collision-freedom), with one sub-folder per revision and the package tree
//! nested under each revision. Platforms with low path-length ceilings can
//! relocate revision folders under a short root; the canonical location then
//! holds a `.depot_link` sentinel recording the real target, and resolution
//! is an explicit tri-state so a broken link is never mistaken for "not
//! shortened".

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use depot_domain::{PackageReference, RecipeReference, ReferenceError};

use crate::error::CacheError;

pub const SHORT_LINK_FILENAME: &str = ".depot_link";
pub(crate) const LATEST_POINTER_FILENAME: &str = "latest";
pub(crate) const PACKAGES_SUBDIR: &str = "p";

/// Width of the identity digest embedded in folder names.
const DIGEST_WIDTH: usize = 12;
/// Readable name prefix kept in front of the digest.
const NAME_WIDTH: usize = 15;
/// Width of short-path folder tokens.
const SHORT_TOKEN_WIDTH: usize = 16;

/// Resolution state of a possibly short-path-relocated folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortPathState {
    /// No link sentinel: the canonical folder is the real folder.
    NotShortened,
    /// Link sentinel present and its target exists.
    ShortenedOk(PathBuf),
    /// Link sentinel present but unreadable or pointing at a missing target.
    ShortenedBroken(PathBuf),
}

#[derive(Serialize, Deserialize)]
struct ShortLinkRecord {
    target: String,
}

/// Derives relative storage folders from references.
#[derive(Debug, Clone, Default)]
pub struct ContentAddresser;

impl ContentAddresser {
    /// Folder shared by every revision of a recipe, relative to the cache
    /// root. Deterministic, collision-free across distinct identities, and
    /// length-stable regardless of how long the recipe name is.
    pub fn recipe_base_folder(&self, reference: &RecipeReference) -> Result<PathBuf, CacheError> {
        reference.validate()?;
        let key = reference.base_key();
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let name: String = reference.name.chars().take(NAME_WIDTH).collect();
        Ok(PathBuf::from(format!("{name}-{}", &digest[..DIGEST_WIDTH])))
    }

    /// Folder of one specific recipe revision.
    pub fn recipe_revision_folder(
        &self,
        reference: &RecipeReference,
    ) -> Result<PathBuf, CacheError> {
        let revision = reference
            .revision
            .as_deref()
            .ok_or_else(|| ReferenceError::InvalidComponent {
                field: "revision",
                value: String::new(),
                reason: "revision required for storage addressing",
            })?;
        Ok(self.recipe_base_folder(reference)?.join(revision))
    }

    /// Folder shared by every revision of one package-id, under its recipe
    /// revision folder.
    pub fn package_base_folder(
        &self,
        reference: &PackageReference,
    ) -> Result<PathBuf, CacheError> {
        reference.validate()?;
        Ok(self
            .recipe_revision_folder(&reference.recipe)?
            .join(PACKAGES_SUBDIR)
            .join(&reference.package_id))
    }

    /// Folder of one specific package revision.
    pub fn package_revision_folder(
        &self,
        reference: &PackageReference,
    ) -> Result<PathBuf, CacheError> {
        let revision = reference
            .revision
            .as_deref()
            .ok_or_else(|| ReferenceError::InvalidComponent {
                field: "package-revision",
                value: String::new(),
                reason: "revision required for storage addressing",
            })?;
        Ok(self.package_base_folder(reference)?.join(revision))
    }
}

/// Classify `canonical` against its short-path sentinel.
pub fn short_path_state(canonical: &Path) -> ShortPathState {
    let link = canonical.join(SHORT_LINK_FILENAME);
    if !link.exists() {
        return ShortPathState::NotShortened;
    }
    let Ok(text) = fs::read_to_string(&link) else {
        return ShortPathState::ShortenedBroken(canonical.to_path_buf());
    };
    let Ok(record) = serde_json::from_str::<ShortLinkRecord>(&text) else {
        return ShortPathState::ShortenedBroken(canonical.to_path_buf());
    };
    let target = PathBuf::from(record.target);
    if target.is_dir() {
        ShortPathState::ShortenedOk(target)
    } else {
        ShortPathState::ShortenedBroken(canonical.to_path_buf())
    }
}

/// Resolve `canonical` through its sentinel, treating a broken link as a
/// corrupted cache entry rather than an absent one.
pub fn resolve_short_path(canonical: &Path) -> Result<PathBuf, CacheError> {
    match short_path_state(canonical) {
        ShortPathState::NotShortened => Ok(canonical.to_path_buf()),
        ShortPathState::ShortenedOk(target) => Ok(target),
        ShortPathState::ShortenedBroken(path) => Err(CacheError::CorruptedCache { path }),
    }
}

/// Relocate `canonical` under `short_root` and leave the sentinel behind.
/// Returns the short target that all subsequent accessors resolve to.
pub fn shorten_folder(canonical: &Path, short_root: &Path) -> Result<PathBuf> {
    let digest = hex::encode(Sha256::digest(canonical.display().to_string().as_bytes()));
    let target = short_root.join(&digest[..SHORT_TOKEN_WIDTH]);
    fs::create_dir_all(&target)
        .with_context(|| format!("failed to create short folder {}", target.display()))?;
    fs::create_dir_all(canonical)
        .with_context(|| format!("failed to create {}", canonical.display()))?;
    let record = ShortLinkRecord {
        target: target.display().to_string(),
    };
    let link = canonical.join(SHORT_LINK_FILENAME);
    fs::write(&link, serde_json::to_string(&record)?)
        .with_context(|| format!("failed to write link sentinel {}", link.display()))?;
    Ok(target)
}

/// Read the latest-revision pointer beside the revision folders, falling
/// back to the most recently modified revision folder for caches written
/// before the pointer existed.
pub(crate) fn read_latest_pointer(base: &Path) -> Option<String> {
    let pointer = base.join(LATEST_POINTER_FILENAME);
    if let Ok(text) = fs::read_to_string(&pointer) {
        let revision = text.trim().to_string();
        if !revision.is_empty() && base.join(&revision).is_dir() {
            return Some(revision);
        }
    }
    newest_subdir(base)
}

/// Durably record `revision` as the latest under `base` (write-then-rename,
/// so readers never observe a half-written pointer).
pub(crate) fn write_latest_pointer(base: &Path, revision: &str) -> Result<()> {
    let pointer = base.join(LATEST_POINTER_FILENAME);
    let tmp = tempfile::NamedTempFile::new_in(base)
        .with_context(|| format!("failed to stage latest pointer under {}", base.display()))?;
    fs::write(tmp.path(), revision)
        .with_context(|| format!("failed to write latest pointer under {}", base.display()))?;
    tmp.persist(&pointer)
        .map_err(|err| anyhow::anyhow!("failed to publish latest pointer: {err}"))?;
    Ok(())
}

fn newest_subdir(base: &Path) -> Option<String> {
    let entries = fs::read_dir(base).ok()?;
    let mut newest: Option<(std::time::SystemTime, String)> = None;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if name.starts_with('_') {
            // Staging folders are not yet published revisions.
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        match &newest {
            Some((best, _)) if *best >= modified => {}
            _ => newest = Some((modified, name)),
        }
    }
    newest.map(|(_, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str) -> RecipeReference {
        RecipeReference::new(name, "1.0").with_user_channel("corp", "stable")
    }

    #[test]
    fn folder_derivation_is_deterministic() {
        let addresser = ContentAddresser;
        let r = reference("zlib").with_revision("abc123");
        assert_eq!(
            addresser.recipe_revision_folder(&r).expect("first"),
            addresser.recipe_revision_folder(&r).expect("second"),
        );
    }

    #[test]
    fn distinct_references_map_to_distinct_folders() {
        let addresser = ContentAddresser;
        let base = RecipeReference::new("zlib", "1.3");
        let variants = [
            RecipeReference::new("zlib", "1.4"),
            RecipeReference::new("zlib2", "1.3"),
            RecipeReference::new("zlib", "1.3").with_user_channel("corp", "stable"),
            RecipeReference::new("zlib", "1.3").with_user_channel("corp", "testing"),
        ];
        let base_folder = addresser.recipe_base_folder(&base).expect("base");
        for variant in &variants {
            assert_ne!(
                base_folder,
                addresser.recipe_base_folder(variant).expect("variant"),
                "collision for {variant}"
            );
        }

        let with_rev = base.with_revision("aa11");
        let other_rev = base.with_revision("bb22");
        assert_ne!(
            addresser.recipe_revision_folder(&with_rev).expect("rev a"),
            addresser.recipe_revision_folder(&other_rev).expect("rev b"),
        );
    }

    #[test]
    fn folder_length_is_stable_for_long_names() {
        let addresser = ContentAddresser;
        let short = addresser
            .recipe_base_folder(&RecipeReference::new("abc", "1.0"))
            .expect("short");
        let long = addresser
            .recipe_base_folder(&RecipeReference::new(
                "a-library-with-an-unreasonably-long-registry-name",
                "1.0",
            ))
            .expect("long");
        let width = |p: &PathBuf| p.as_os_str().len();
        assert!(width(&long) <= NAME_WIDTH + 1 + DIGEST_WIDTH);
        assert!(width(&short) <= width(&long));
    }

    #[test]
    fn invalid_components_are_rejected() {
        let addresser = ContentAddresser;
        let err = addresser
            .recipe_base_folder(&RecipeReference::new("", "1.0"))
            .unwrap_err();
        assert_eq!(err.code(), "DP600");

        let err = addresser
            .recipe_base_folder(&RecipeReference::new("a/b", "1.0"))
            .unwrap_err();
        assert_eq!(err.code(), "DP600");
    }

    #[test]
    fn package_folders_nest_under_recipe_revision() {
        let addresser = ContentAddresser;
        let recipe = reference("openssl").with_revision("aa11");
        let package = PackageReference::new(recipe.clone(), "9f86d081").with_revision("bb22");
        let folder = addresser.package_revision_folder(&package).expect("folder");
        assert!(folder.starts_with(addresser.recipe_revision_folder(&recipe).expect("recipe")));
        assert!(folder.ends_with(Path::new("p/9f86d081/bb22")));
    }

    #[test]
    fn revisionless_addressing_is_an_error() {
        let addresser = ContentAddresser;
        let err = addresser
            .recipe_revision_folder(&reference("zlib"))
            .unwrap_err();
        assert_eq!(err.code(), "DP600");
    }

    #[test]
    fn short_path_tri_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let canonical = temp.path().join("zlib-abcdef/aa11");
        let short_root = temp.path().join("short");

        assert_eq!(short_path_state(&canonical), ShortPathState::NotShortened);

        let target = shorten_folder(&canonical, &short_root).expect("shorten");
        assert_eq!(
            short_path_state(&canonical),
            ShortPathState::ShortenedOk(target.clone())
        );
        assert_eq!(resolve_short_path(&canonical).expect("resolve"), target);

        fs::remove_dir_all(&target).expect("break target");
        assert!(matches!(
            short_path_state(&canonical),
            ShortPathState::ShortenedBroken(_)
        ));
        let err = resolve_short_path(&canonical).unwrap_err();
        assert_eq!(err.code(), "DP620");
    }

    #[test]
    fn latest_pointer_round_trip_and_fallback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path();
        fs::create_dir_all(base.join("aa11")).expect("mkdir");
        fs::create_dir_all(base.join("bb22")).expect("mkdir");

        write_latest_pointer(base, "aa11").expect("write");
        assert_eq!(read_latest_pointer(base).as_deref(), Some("aa11"));

        // Pointer naming a missing folder falls back to the newest folder.
        write_latest_pointer(base, "gone").expect("write");
        let older = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(base.join("aa11"), older).expect("mtime");
        assert_eq!(read_latest_pointer(base).as_deref(), Some("bb22"));
    }

    #[test]
    fn staging_folders_are_ignored_by_fallback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path();
        fs::create_dir_all(base.join("aa11")).expect("mkdir");
        fs::create_dir_all(base.join("_staging-xyz")).expect("mkdir");

        assert_eq!(read_latest_pointer(base).as_deref(), Some("aa11"));
    }
}
