use std::path::PathBuf;

use depot_domain::ReferenceError;

/// Errors surfaced by the cache storage layer.
///
/// All variants carry a bracketed diagnostic code in their message; `code()`
/// exposes the same code for machine consumption. The layer performs no
/// internal retries, so every variant reaches the caller exactly once.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    InvalidReference(#[from] ReferenceError),
    #[error("[DP610] storage failure at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "[DP620] cache folder {} is corrupted (a previous operation did not \
         complete); remove the folder manually or enable auto-repair",
        path.display()
    )]
    CorruptedCache { path: PathBuf },
    #[error("[DP630] manifest error under {}: {detail}", path.display())]
    ManifestMismatch { path: PathBuf, detail: String },
    #[error("[DP640] timed out after {waited_ms} ms waiting for {mode} lock on {key}")]
    LockTimeout {
        key: String,
        mode: &'static str,
        waited_ms: u128,
    },
    #[error("[DP650] no cache entry for {reference}: {reason}")]
    MissingEntry {
        reference: String,
        reason: &'static str,
    },
}

impl CacheError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidReference(_) => "DP600",
            Self::Storage { .. } => "DP610",
            Self::CorruptedCache { .. } => "DP620",
            Self::ManifestMismatch { .. } => "DP630",
            Self::LockTimeout { .. } => "DP640",
            Self::MissingEntry { .. } => "DP650",
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}
