//! Compiled composition bundles.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::key::CacheKey;
use crate::utils::fs;

/// A compiled composition, shared between the cache and running renders.
///
/// Held behind an `Arc`. When `remove_on_drop` is set, the bundle directory is
/// deleted once the last holder lets go, so an entry evicted from the cache
/// while a render still uses it stays valid until that render finishes.
#[derive(Debug)]
pub struct CompiledArtifact {
    key: CacheKey,
    bundle_dir: PathBuf,
    entry_point: PathBuf,
    remove_on_drop: bool,
}

impl CompiledArtifact {
    pub fn new(key: CacheKey, bundle_dir: impl Into<PathBuf>, entry_point: impl Into<PathBuf>) -> Self {
        Self {
            key,
            bundle_dir: bundle_dir.into(),
            entry_point: entry_point.into(),
            remove_on_drop: false,
        }
    }

    /// Delete the bundle directory when the artifact is dropped.
    pub fn remove_on_drop(mut self) -> Self {
        self.remove_on_drop = true;
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    pub fn entry_point(&self) -> &Path {
        &self.entry_point
    }
}

impl Drop for CompiledArtifact {
    fn drop(&mut self) {
        if !self.remove_on_drop {
            return;
        }

        let dir = std::mem::take(&mut self.bundle_dir);
        let key = self.key.short().to_string();
        let remove = move || match fs::remove_dir_all_if_exists_sync(&dir) {
            Ok(_) => debug!(key = %key, path = %dir.display(), "Removed compiled bundle"),
            Err(e) => warn!(key = %key, error = %e, "Failed to remove compiled bundle"),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutputGeometry;

    fn key() -> CacheKey {
        CacheKey::new(
            "src",
            &OutputGeometry {
                width: 640,
                height: 360,
                fps: 30,
                duration_frames: 30,
            },
        )
    }

    #[test]
    fn owned_bundle_is_removed_with_last_reference() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();

        let artifact = std::sync::Arc::new(
            CompiledArtifact::new(key(), &bundle, bundle.join("index.js")).remove_on_drop(),
        );
        let reader = artifact.clone();

        drop(artifact);
        assert!(bundle.exists());
        drop(reader);
        assert!(!bundle.exists());
    }

    #[test]
    fn borrowed_bundle_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = CompiledArtifact::new(key(), dir.path(), dir.path().join("index.js"));
        drop(artifact);
        assert!(dir.path().exists());
    }
}
