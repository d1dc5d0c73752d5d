//! Content-addressed compile cache keys.

use sha2::{Digest, Sha256};

use crate::domain::OutputGeometry;

/// Bumped whenever the key derivation changes.
const KEY_VERSION: &[u8] = b"clipforge-compile-v1";

/// SHA-256 over the composition source and output geometry.
///
/// Runtime data (clips, objects, texts) is deliberately absent, so one
/// compiled bundle serves every job sharing a template and geometry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(source: &str, geometry: &OutputGeometry) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_VERSION);
        // Length prefix keeps the source from bleeding into the numeric fields.
        hasher.update((source.len() as u64).to_le_bytes());
        hasher.update(source.as_bytes());
        hasher.update(geometry.width.to_le_bytes());
        hasher.update(geometry.height.to_le_bytes());
        hasher.update(geometry.fps.to_le_bytes());
        hasher.update(geometry.duration_frames.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
