//! Composition compilation: cache keys, artifacts and the compile cache.

pub mod artifact;
pub mod cache;
pub mod key;

pub use artifact::CompiledArtifact;
pub use cache::{CacheConfig, CacheStats, CompileCache};
pub use key::CacheKey;
