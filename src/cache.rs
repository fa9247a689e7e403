//! # Content-Addressed Image Cache
//!
//! Base-image builds are keyed by a fingerprint over their canonicalised
//! inputs. The cache maps each fingerprint to the image id of a previous
//! build:
//!
//! ```text
//! <cache-root>/
//! └── sha256/
//!     ├── 1f3a...   (text file holding an image id)
//!     └── 9bc0...
//! ```
//!
//! Entries are written atomically via a temp file + rename. A fingerprint
//! change simply selects a new slot; there is no eviction. The cache does
//! not verify that an id still resolves against the engine; callers must.

use crate::constants::HASH_VERSION;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Fingerprint
// =============================================================================

/// A digest over the canonicalised inputs of a base-image build.
///
/// Insertion order of extras and custom images never affects the
/// fingerprint; any change to the base id, a source id, a target
/// reference, a version token, or the hash-version constant does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    algorithm: &'static str,
    hex: String,
}

impl Fingerprint {
    /// Computes the fingerprint from resolved build inputs.
    ///
    /// * `base_image_id` - the resolved id of the base image, not its tag.
    /// * `tag_pairs` - (target reference, source image id) for every
    ///   preloaded image.
    /// * `version_envs` - version environment declarations.
    pub fn compute(
        base_image_id: &str,
        tag_pairs: &[(String, String)],
        version_envs: &[String],
    ) -> Fingerprint {
        let mut canonical = String::new();
        let _ = writeln!(canonical, "Version: {}\n", HASH_VERSION);
        let _ = writeln!(canonical, "{}\n", base_image_id);

        let mut pairs: Vec<&(String, String)> = tag_pairs.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        for (target, image_id) in pairs {
            let _ = writeln!(canonical, "{} {}", target, image_id);
        }
        canonical.push('\n');

        let mut envs: Vec<&String> = version_envs.iter().collect();
        envs.sort();
        canonical.push('\n');
        let _ = writeln!(
            canonical,
            "{}",
            envs.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
        );

        Fingerprint {
            algorithm: "sha256",
            hex: hex::encode(Sha256::digest(canonical.as_bytes())),
        }
    }

    pub fn algorithm(&self) -> &str {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

// =============================================================================
// Image Cache
// =============================================================================

/// Filesystem-backed map from fingerprint to image id.
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    /// A cache rooted at the given directory. The directory is created
    /// lazily on the first write.
    pub fn new(root: impl Into<PathBuf>) -> ImageCache {
        ImageCache { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.algorithm()).join(fingerprint.hex())
    }

    /// Reads the image id cached for a fingerprint. Absence is the typed
    /// [`Error::CacheEntryNotFound`], which drives a rebuild.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<String> {
        let path = self.entry_path(fingerprint);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::CacheEntryNotFound {
                fingerprint: fingerprint.to_string(),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Records an image id for a fingerprint. The entry file is written
    /// to a temporary name and renamed into place so readers never see a
    /// partial entry.
    pub fn put(&self, fingerprint: &Fingerprint, image_id: &str) -> Result<()> {
        let path = self.entry_path(fingerprint);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
        }

        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        std::fs::write(&temp_path, image_id)
            .map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
        std::fs::rename(&temp_path, &path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            Error::CacheWriteFailed(e.to_string())
        })?;

        debug!("saved {}->{} at {}", fingerprint, image_id, path.display());
        Ok(())
    }
}
