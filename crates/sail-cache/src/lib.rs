//! Content-addressed cache for task outputs.
//!
//! Layout under a configurable cache root:
//!
//! ```text
//! <root>/v1/
//!   index.json
//!   statistics.json
//!   entries/<key>/
//!     manifest.json
//!     outputs/<preserved relative paths>
//! ```
//!
//! Entries are immutable once written. Every persisted file goes through a
//! sibling temp path and an atomic rename, and the index update is the commit
//! point: a half-written entry never appears in the index.

/// A wrapper that performs cache writes on a bounded pool of workers.
mod async_cache;
mod index;
mod manifest;
mod statistics;
/// The on-disk store itself.
mod store;

pub use async_cache::AsyncCacheStore;
pub use index::{CacheIndex, IndexEntry};
pub use manifest::{CacheManifest, OutputFile};
use sail_paths::PathError;
pub use statistics::CacheStatistics;
pub use store::{CacheStore, PruneResult, StoreRequest, VerifyReport};
use thiserror::Error;

/// Bumped when the on-disk layout changes; roots written by other versions
/// are ignored and read as a cold cache.
pub const CACHE_SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Invalid file path: {0}")]
    Path(#[from] PathError),
    #[error("Invalid cache metadata file")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("Failed to serialize cache metadata")]
    MetadataWriteFailure(#[source] serde_json::Error),
    #[error("restored file {path} did not match manifest hash")]
    Corruption { path: String },
    #[error("cache entry for {0} is missing from the store")]
    MissingEntry(String),
    #[error("Unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

/// Configuration for the on-disk store, owned by the run that creates it.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum total size of stored entries before `prune` starts evicting,
    /// least recently used first. `None` means unbounded.
    pub max_size_bytes: Option<u64>,
    /// Rehash restored files against the manifest and fail the restore on a
    /// mismatch.
    pub verify_integrity: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: None,
            verify_integrity: false,
        }
    }
}
