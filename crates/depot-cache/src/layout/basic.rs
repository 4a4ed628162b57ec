use std::path::{Path, PathBuf};

use super::METADATA_FOLDER;

/// Degenerate layout for editable references: the recipe stays in its
/// external working copy and nothing is copied into the cache. The metadata
/// folder is derived beside the external recipe file so sidecar data
/// (build logs, generated metadata) still has a stable home.
#[derive(Debug, Clone)]
pub struct BasicLayout {
    base: PathBuf,
    recipe_file: Option<PathBuf>,
}

impl BasicLayout {
    /// Layout over an external project folder. `recipe_file` is `None` for
    /// placeholder references that carry no recipe at all.
    #[must_use]
    pub fn new(base: PathBuf, recipe_file: Option<PathBuf>) -> Self {
        Self { base, recipe_file }
    }

    #[must_use]
    pub fn base_folder(&self) -> &Path {
        &self.base
    }

    /// The external recipe file, untouched by the cache.
    #[must_use]
    pub fn recipe_file(&self) -> Option<&Path> {
        self.recipe_file.as_deref()
    }

    /// Sidecar metadata folder next to the external recipe.
    #[must_use]
    pub fn metadata(&self) -> PathBuf {
        self.recipe_file
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or(&self.base)
            .join(METADATA_FOLDER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_the_external_recipe_directly() {
        let layout = BasicLayout::new(
            PathBuf::from("/work/zlib"),
            Some(PathBuf::from("/work/zlib/depotfile.toml")),
        );
        assert_eq!(layout.base_folder(), Path::new("/work/zlib"));
        assert_eq!(
            layout.recipe_file(),
            Some(Path::new("/work/zlib/depotfile.toml"))
        );
        assert_eq!(layout.metadata(), PathBuf::from("/work/zlib/metadata"));
    }

    #[test]
    fn placeholder_without_recipe_uses_the_base_folder() {
        let layout = BasicLayout::new(PathBuf::from("/work/meta-pkg"), None);
        assert_eq!(layout.recipe_file(), None);
        assert_eq!(layout.metadata(), PathBuf::from("/work/meta-pkg/metadata"));
    }
}
