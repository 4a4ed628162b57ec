//! Reference layouts: named sub-folder accessors over one base folder.
//!
//! Sub-folder roles use fixed short names to keep paths inside the length
//! ceiling of path-limited platforms; the vocabulary is part of the cache
//! format and changing it requires a migration.

mod basic;
mod package;
mod recipe;

pub use basic::BasicLayout;
pub use package::PackageLayout;
pub use recipe::RecipeLayout;

pub(crate) const EXPORT_FOLDER: &str = "e";
pub(crate) const EXPORT_SOURCES_FOLDER: &str = "es";
pub(crate) const SOURCE_FOLDER: &str = "s";
pub(crate) const BUILD_FOLDER: &str = "b";
pub(crate) const FINALIZE_FOLDER: &str = "f";
pub(crate) const DOWNLOAD_FOLDER: &str = "d";
pub(crate) const METADATA_FOLDER: &str = "metadata";

pub const RECIPE_FILENAME: &str = "depotfile.toml";
pub const RECIPE_DATA_FILENAME: &str = "depotdata.toml";
