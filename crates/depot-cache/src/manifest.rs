//! File-tree digests used for integrity checks.
//!
//! A manifest maps `/`-normalized relative paths to sha256 sums and carries
//! the timestamp it was computed at. Equality compares the file sums only;
//! the timestamp participates in recency comparisons when resolving update
//! conflicts. Persisted as `depotmanifest.txt`: first line the integer
//! timestamp, then one `<relative-path>: <hex-sha256>` line per file,
//! sorted by path.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::dirty::DIRTY_SUFFIX;
use crate::error::CacheError;

pub const MANIFEST_FILENAME: &str = "depotmanifest.txt";

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    timestamp: u64,
    file_sums: BTreeMap<String, String>,
}

/// Paths that differ between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ManifestDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.file_sums == other.file_sums
    }
}

impl Eq for Manifest {}

impl Manifest {
    /// Walk `folders` and digest every regular file. The first folder's
    /// entries are keyed by bare relative path; entries from additional
    /// folders are prefixed with that folder's name so the combined mapping
    /// stays collision-free. The manifest file itself and dirty sentinels
    /// are excluded.
    pub fn compute_from<P: AsRef<Path>>(folders: &[P]) -> Result<Self> {
        let mut file_sums = BTreeMap::new();
        for (index, folder) in folders.iter().enumerate() {
            let folder = folder.as_ref();
            if !folder.exists() {
                continue;
            }
            let prefix = if index == 0 {
                None
            } else {
                folder.file_name().map(|name| name.to_string_lossy().into_owned())
            };
            for entry in WalkDir::new(folder).sort_by_file_name() {
                let entry = entry
                    .with_context(|| format!("failed to walk {}", folder.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name == MANIFEST_FILENAME || name.ends_with(DIRTY_SUFFIX) {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(folder)
                    .with_context(|| format!("entry escaped walk root {}", folder.display()))?;
                let mut key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if let Some(prefix) = &prefix {
                    key = format!("{prefix}/{key}");
                }
                file_sums.insert(key, hash_file(entry.path())?);
            }
        }
        Ok(Self {
            timestamp: unix_timestamp(),
            file_sums,
        })
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn file_sums(&self) -> &BTreeMap<String, String> {
        &self.file_sums
    }

    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.timestamp > other.timestamp
    }

    /// Paths present, absent, or changed in `other` relative to `self`.
    #[must_use]
    pub fn diff(&self, other: &Self) -> ManifestDiff {
        let mut diff = ManifestDiff::default();
        for (path, sum) in &other.file_sums {
            match self.file_sums.get(path) {
                None => diff.added.push(path.clone()),
                Some(existing) if existing != sum => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.file_sums.keys() {
            if !other.file_sums.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }
        diff
    }

    /// Persist into `folder/depotmanifest.txt`.
    pub fn save(&self, folder: &Path) -> Result<()> {
        fs::create_dir_all(folder)
            .with_context(|| format!("failed to create {}", folder.display()))?;
        let path = folder.join(MANIFEST_FILENAME);
        fs::write(&path, self.render())
            .with_context(|| format!("failed to write manifest {}", path.display()))?;
        Ok(())
    }

    /// Load the manifest persisted in `folder`. A missing file surfaces the
    /// underlying not-found error so callers can react to "never recorded";
    /// a present but malformed file is a manifest error.
    pub fn load(folder: &Path) -> Result<Self> {
        let path = folder.join(MANIFEST_FILENAME);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::parse(&text).ok_or_else(|| {
            CacheError::ManifestMismatch {
                path: path.clone(),
                detail: "malformed manifest file".to_string(),
            }
            .into()
        })
    }

    fn render(&self) -> String {
        let mut out = format!("{}\n", self.timestamp);
        for (path, sum) in &self.file_sums {
            out.push_str(path);
            out.push_str(": ");
            out.push_str(sum);
            out.push('\n');
        }
        out
    }

    fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let timestamp = lines.next()?.trim().parse::<u64>().ok()?;
        let mut file_sums = BTreeMap::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let (path, sum) = line.rsplit_once(": ")?;
            file_sums.insert(path.to_string(), sum.trim().to_string());
        }
        Some(Self {
            timestamp,
            file_sums,
        })
    }
}

/// Raise a manifest mismatch naming the differing paths, or succeed when the
/// recorded and freshly computed manifests agree.
pub fn verify_match(recorded: &Manifest, expected: &Manifest, folder: &Path) -> Result<(), CacheError> {
    if recorded == expected {
        return Ok(());
    }
    let diff = recorded.diff(expected);
    Err(CacheError::ManifestMismatch {
        path: folder.to_path_buf(),
        detail: format!(
            "added {:?}, removed {:?}, changed {:?}",
            diff.added, diff.removed, diff.changed
        ),
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
