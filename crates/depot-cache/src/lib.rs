#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Local package cache: reference-addressed storage layouts, dirty-state
//! tracking, manifest integrity, and cross-process locking.

pub mod address;
pub mod cache;
pub mod dirty;
pub mod error;
mod fsutil;
pub mod layout;
pub mod lock;
pub mod manifest;

pub use address::{ContentAddresser, ShortPathState};
pub use cache::{CacheConfig, DepotCache, LockPolicy};
pub use error::CacheError;
pub use layout::{BasicLayout, PackageLayout, RecipeLayout};
pub use lock::{FileLocker, LockGuard, Locker, NoopLocker};
pub use manifest::{Manifest, ManifestDiff};

#[cfg(test)]
mod tests;
