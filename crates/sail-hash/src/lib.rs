//! Per-run file hash cache.
//!
//! Memoizes SHA-256 digests of file contents keyed by absolute path. The
//! cache lives for a single run and is passed explicitly through the build
//! context; it is never a process global so tests stay hermetic.

use dashmap::DashMap;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use sail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Hash value recorded for files that do not exist. Done-file entries for
/// absent outputs must serialize to a stable value rather than erroring, so
/// diffs between runs stay meaningful.
pub const MISSING_FILE_HASH: &str = "<missing>";

type SharedHash = Shared<BoxFuture<'static, String>>;

/// Concurrent map of path -> content digest. A digest is computed at most
/// once per path; concurrent callers share the in-flight future.
#[derive(Default)]
pub struct FileHashCache {
    hashes: DashMap<AbsoluteSystemPathBuf, SharedHash>,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the hex SHA-256 of the file's contents, or
    /// [`MISSING_FILE_HASH`] if the file does not exist.
    pub async fn hash(&self, path: &AbsoluteSystemPath) -> String {
        let fut = {
            let entry = self.hashes.entry(path.to_owned()).or_insert_with(|| {
                let path = path.to_owned();
                async move { hash_file(&path).await }.boxed().shared()
            });
            // Clone out of the map entry so the shard lock is not held
            // across the await.
            entry.value().clone()
        };
        fut.await
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

async fn hash_file(path: &AbsoluteSystemPath) -> String {
    match tokio::fs::read(path.as_std_path()).await {
        Ok(contents) => hash_bytes(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => MISSING_FILE_HASH.to_string(),
        Err(e) => {
            warn!("failed to read {path} for hashing: {e}");
            MISSING_FILE_HASH.to_string()
        }
    }
}

/// Hex SHA-256 of the given bytes. The same digest the cache store uses for
/// manifest verification, kept here so all content hashing agrees.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod test {
    use sail_paths::AbsoluteSystemPath;

    use super::*;

    #[tokio::test]
    async fn test_hash_matches_contents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let file = root.join_component("input.txt");
        file.create_with_contents("hello sail")?;

        let cache = FileHashCache::new();
        let hash = cache.hash(&file).await;
        assert_eq!(hash, hash_bytes(b"hello sail"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_sentinel() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let missing = root.join_component("does-not-exist.txt");

        let cache = FileHashCache::new();
        assert_eq!(cache.hash(&missing).await, MISSING_FILE_HASH);
        Ok(())
    }

    #[tokio::test]
    async fn test_memoized_across_rewrites() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let file = root.join_component("input.txt");
        file.create_with_contents("before")?;

        let cache = FileHashCache::new();
        let first = cache.hash(&file).await;
        // The cache is per-run; a rewrite during the run must not change the
        // answer we already handed out.
        file.create_with_contents("after")?;
        let second = cache.hash(&file).await;
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_computation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let file = root.join_component("input.txt");
        file.create_with_contents("shared")?;

        let cache = std::sync::Arc::new(FileHashCache::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let file = file.clone();
            handles.push(tokio::spawn(async move { cache.hash(&file).await }));
        }
        for handle in handles {
            assert_eq!(handle.await?, hash_bytes(b"shared"));
        }
        assert_eq!(cache.len(), 1);
        Ok(())
    }
}
