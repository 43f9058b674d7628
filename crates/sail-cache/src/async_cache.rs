use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

use crate::{CacheError, CacheManifest, CacheStore, PruneResult, StoreRequest, VerifyReport};
use sail_paths::{AbsoluteSystemPath, AnchoredSystemPathBuf};

/// Write-behind wrapper over [`CacheStore`]. Reads go straight through;
/// writes run on a bounded pool of workers so task completion is not blocked
/// on cache IO. Store failures are logged and dropped, never surfaced.
pub struct AsyncCacheStore {
    store: Arc<CacheStore>,
    writes: Mutex<FuturesUnordered<JoinHandle<()>>>,
    max_workers: usize,
}

impl AsyncCacheStore {
    pub fn new(store: CacheStore, max_workers: usize) -> Self {
        Self {
            store: Arc::new(store),
            writes: Mutex::new(FuturesUnordered::new()),
            max_workers: max_workers.max(1),
        }
    }

    pub fn lookup(&self, key: &str) -> Result<Option<CacheManifest>, CacheError> {
        self.store.lookup(key)
    }

    pub fn restore(
        &self,
        manifest: &CacheManifest,
        package_dir: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        self.store.restore(manifest, package_dir)
    }

    /// Queues a store. If the pool is full this waits for one in-flight
    /// write to finish before enqueueing, bounding memory held by pending
    /// writes.
    pub async fn store(&self, request: StoreRequest) {
        let mut writes = self.writes.lock().await;
        if writes.len() >= self.max_workers {
            writes.next().await;
        }
        let store = self.store.clone();
        writes.push(tokio::spawn(async move {
            let key = request.key.clone();
            if let Err(e) = store.store(request) {
                debug!("cache store for {key} failed: {e}");
            }
        }));
    }

    /// Drains all pending writes. Called at the end of a run so entries from
    /// this run are visible to the next one.
    pub async fn wait_for_writes(&self) {
        let mut writes = self.writes.lock().await;
        while writes.next().await.is_some() {}
    }

    pub fn prune(&self) -> Result<PruneResult, CacheError> {
        self.store.prune()
    }

    pub fn verify(&self, fix: bool) -> Result<VerifyReport, CacheError> {
        self.store.verify(fix)
    }

    pub fn statistics(&self) -> crate::CacheStatistics {
        self.store.statistics()
    }
}
