use std::fs;

use anyhow::Result;
use tempfile::TempDir;

use depot_domain::RecipeReference;

use crate::cache::{CacheConfig, DepotCache, LockPolicy};
use crate::layout::RecipeLayout;
use crate::manifest::Manifest;


fn new_cache() -> Result<(TempDir, DepotCache)> {
    new_cache_with(|_| {})
}

fn new_cache_with(
    adjust: impl FnOnce(&mut CacheConfig),
) -> Result<(TempDir, DepotCache)> {
    let temp = tempfile::tempdir()?;
    let mut config = CacheConfig::new(temp.path().join("cache"));
    config.short_paths = false;
    config.short_root = Some(temp.path().join("short"));
    config.lock_policy = LockPolicy::Disabled;
    adjust(&mut config);
    let cache = DepotCache::new(config)?;
    Ok((temp, cache))
}

fn demo_reference() -> RecipeReference {
    RecipeReference::new("zlib", "1.3.1").with_user_channel("corp", "stable")
}

/// Write a recipe into the export tree and record its manifest, the way the
/// export step does before computing the revision.
fn populate_export(layout: &RecipeLayout, body: &str) -> Result<Manifest> {
    fs::create_dir_all(layout.export())?;
    fs::create_dir_all(layout.export_sources())?;
    fs::write(layout.recipe_file(), body)?;
    fs::write(layout.export_sources().join("fix.patch"), b"--- a\n+++ b\n")?;
    let manifest = Manifest::compute_from(&[&layout.export(), &layout.export_sources()])?;
    manifest.save(&layout.export())?;
    Ok(manifest)
}
