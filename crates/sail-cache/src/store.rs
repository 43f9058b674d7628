use std::{
    sync::Mutex,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use sail_hash::hash_bytes;
use sail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tracing::debug;

use crate::{
    CacheConfig, CacheError, CacheIndex, CacheManifest, CacheStatistics, IndexEntry, OutputFile,
    CACHE_SCHEMA_VERSION,
};

/// The on-disk content-addressed store. Safe for concurrent use from the
/// tasks of a single process; cross-process writers are best-effort and any
/// resulting corruption is caught by `verify` or read as a miss.
pub struct CacheStore {
    /// `<configured root>/v1`
    root: AbsoluteSystemPathBuf,
    entries_dir: AbsoluteSystemPathBuf,
    config: CacheConfig,
    state: Mutex<State>,
}

/// Index and statistics move together so a store commit is one critical
/// section.
struct State {
    index: CacheIndex,
    statistics: CacheStatistics,
}

/// Everything needed to persist one successful task execution.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub key: String,
    pub package_dir: AbsoluteSystemPathBuf,
    pub outputs: Vec<AnchoredSystemPathBuf>,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Default, PartialEq)]
pub struct PruneResult {
    pub removed: usize,
    pub reclaimed_bytes: u64,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub corrupted: Vec<String>,
    pub removed: usize,
}

impl CacheStore {
    pub fn new(cache_root: &AbsoluteSystemPath, config: CacheConfig) -> Result<Self, CacheError> {
        let root = cache_root.join_component(CACHE_SCHEMA_VERSION);
        let entries_dir = root.join_component("entries");
        entries_dir.create_dir_all()?;

        let index = CacheIndex::load(&root.join_component("index.json"));
        let statistics = CacheStatistics::load(&root.join_component("statistics.json"));

        Ok(Self {
            root,
            entries_dir,
            config,
            state: Mutex::new(State { index, statistics }),
        })
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.state.lock().expect("cache state poisoned").statistics.clone()
    }

    /// Looks up a cache key. Any unreadable or malformed entry reads as a
    /// miss; the store never fails a build over its own contents.
    pub fn lookup(&self, key: &str) -> Result<Option<CacheManifest>, CacheError> {
        let entry_dir = self.entry_dir(key);
        let manifest_path = entry_dir.join_component("manifest.json");

        let raw = match manifest_path.read_existing_to_string() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.record_miss();
                return Ok(None);
            }
            Err(e) => {
                debug!("failed reading manifest for {key}: {e}");
                self.record_miss();
                return Ok(None);
            }
        };

        let manifest = match CacheManifest::from_json(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!("malformed manifest for {key}: {e}");
                self.record_miss();
                return Ok(None);
            }
        };

        {
            let mut state = self.state.lock().expect("cache state poisoned");
            let now = now_ms();
            if state.index.get(key).is_some() {
                state.index.touch(key, now);
            } else {
                // Heal the index: the entry exists on disk (at the default
                // location, since the index didn't know it) but a previous
                // index write was lost.
                state.index.insert(
                    key.to_string(),
                    IndexEntry {
                        entry_dir: format!("entries/{key}"),
                        last_access: now,
                        size: manifest.total_size,
                    },
                );
            }
            self.persist_index(&state);
        }

        Ok(Some(manifest))
    }

    /// Copies the entry's outputs into the package directory, creating
    /// intermediate directories. With `verify_integrity` on, every restored
    /// file is rehashed against the manifest and a mismatch aborts the
    /// restore. Captured stdout/stderr replay is the caller's concern.
    pub fn restore(
        &self,
        manifest: &CacheManifest,
        package_dir: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let restore_started = Instant::now();
        let entry_dir = self.entry_dir(&manifest.cache_key);
        let outputs_dir = entry_dir.join_component("outputs");

        let mut restored = Vec::with_capacity(manifest.outputs.len());
        for output in &manifest.outputs {
            let src = outputs_dir.resolve(&output.path);
            let contents = src
                .read()
                .map_err(|_| CacheError::MissingEntry(manifest.cache_key.clone()))?;

            if self.config.verify_integrity && hash_bytes(&contents) != output.hash {
                return Err(CacheError::Corruption {
                    path: output.path.to_string(),
                });
            }

            let dst = package_dir.resolve(&output.path);
            dst.ensure_dir()?;
            dst.create_with_contents(&contents)?;
            #[cfg(unix)]
            dst.set_mode(output.mode)?;
            restored.push(output.path.clone());
        }

        let restore_time_ms = restore_started.elapsed().as_millis() as u64;
        {
            let mut state = self.state.lock().expect("cache state poisoned");
            state
                .statistics
                .record_hit(restore_time_ms, manifest.execution_time_ms);
            self.persist_statistics(&state);
        }

        Ok(restored)
    }

    /// Persists one task's outputs under a fresh entry directory, then
    /// commits it to the index. Only exit-code-zero executions reach this
    /// method.
    pub fn store(&self, request: StoreRequest) -> Result<(), CacheError> {
        let StoreRequest {
            key,
            package_dir,
            outputs,
            stdout,
            stderr,
            execution_time_ms,
        } = request;

        let temp_dir = self
            .entries_dir
            .join_component(&format!(".{key}.{}.tmp", std::process::id()));
        let temp_outputs = temp_dir.join_component("outputs");
        temp_outputs.create_dir_all()?;

        let result = self.write_entry(
            &temp_dir,
            &key,
            &package_dir,
            &outputs,
            stdout,
            stderr,
            execution_time_ms,
        );
        match result {
            Ok(total_size) => {
                self.commit_entry(&temp_dir, &key, total_size)?;
                Ok(())
            }
            Err(e) => {
                // Leave nothing half-written behind.
                let _ = temp_dir.remove_dir_all();
                Err(e)
            }
        }
    }

    fn write_entry(
        &self,
        temp_dir: &AbsoluteSystemPath,
        key: &str,
        package_dir: &AbsoluteSystemPath,
        outputs: &[AnchoredSystemPathBuf],
        stdout: String,
        stderr: String,
        execution_time_ms: u64,
    ) -> Result<u64, CacheError> {
        let temp_outputs = temp_dir.join_component("outputs");

        let mut manifest_outputs = Vec::with_capacity(outputs.len());
        let mut total_size = 0u64;
        for rel_path in outputs {
            let src = package_dir.resolve(rel_path);
            let contents = src.read()?;
            let size = contents.len() as u64;
            let mode = file_mode(&src)?;

            let dst = temp_outputs.resolve(rel_path);
            dst.ensure_dir()?;
            dst.create_with_contents(&contents)?;

            total_size += size;
            manifest_outputs.push(OutputFile {
                path: rel_path.clone(),
                hash: hash_bytes(&contents),
                size,
                mode,
            });
        }

        let manifest = CacheManifest {
            cache_key: key.to_string(),
            created_at: now_ms(),
            outputs: manifest_outputs,
            stdout,
            stderr,
            exit_code: 0,
            execution_time_ms,
            total_size,
        };
        temp_dir
            .join_component("manifest.json")
            .create_with_contents(manifest.to_json()?)?;

        Ok(total_size)
    }

    /// Moves the finished temp directory into place and commits it to the
    /// index. When two stores of the same key race, the second rename fails
    /// and falls back to a uniquely named directory; last writer wins in the
    /// index and the loser's directory is left as an orphan for prune.
    fn commit_entry(
        &self,
        temp_dir: &AbsoluteSystemPath,
        key: &str,
        total_size: u64,
    ) -> Result<(), CacheError> {
        let preferred = self.entries_dir.join_component(key);
        let (final_dir, entry_dir_rel) = match temp_dir.rename(&preferred) {
            Ok(()) => (preferred, format!("entries/{key}")),
            Err(_) => {
                let unique = format!("{key}-{}", std::process::id());
                let fallback = self.entries_dir.join_component(&unique);
                let _ = fallback.remove_dir_all();
                temp_dir.rename(&fallback)?;
                (fallback, format!("entries/{unique}"))
            }
        };
        debug!("stored cache entry for {key} at {final_dir}");

        let mut state = self.state.lock().expect("cache state poisoned");
        state.index.insert(
            key.to_string(),
            IndexEntry {
                entry_dir: entry_dir_rel,
                last_access: now_ms(),
                size: total_size,
            },
        );
        state.statistics.record_store(total_size);
        self.persist_index(&state);
        self.persist_statistics(&state);
        Ok(())
    }

    /// Evicts least-recently-used entries until total size fits under the
    /// configured limit. Whole entry directories are deleted, never
    /// individual files.
    pub fn prune(&self) -> Result<PruneResult, CacheError> {
        let Some(max_size) = self.config.max_size_bytes else {
            return Ok(PruneResult::default());
        };

        let mut state = self.state.lock().expect("cache state poisoned");
        let mut result = PruneResult::default();
        for key in state.index.lru_keys() {
            if state.index.total_size() <= max_size {
                break;
            }
            let Some(entry) = state.index.remove(&key) else {
                continue;
            };
            let entry_dir = self.resolve_entry_dir(&entry.entry_dir);
            if let Err(e) = entry_dir.remove_dir_all() {
                debug!("failed to remove pruned entry {entry_dir}: {e}");
            }
            state.statistics.record_eviction(entry.size);
            result.removed += 1;
            result.reclaimed_bytes += entry.size;
        }
        self.persist_index(&state);
        self.persist_statistics(&state);
        Ok(result)
    }

    /// Scans every entry directory, rehashing outputs against manifests.
    /// With `fix` set, corrupted entries are deleted and dropped from the
    /// index.
    pub fn verify(&self, fix: bool) -> Result<VerifyReport, CacheError> {
        let mut report = VerifyReport::default();
        let mut corrupted_dirs = Vec::new();

        for dir_entry in self.entries_dir.read_dir()? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                // In-flight temp directory from a concurrent writer.
                continue;
            }
            let entry_dir = self.entries_dir.join_component(&name);
            report.checked += 1;
            if !entry_is_intact(&entry_dir) {
                report.corrupted.push(name.clone());
                corrupted_dirs.push((name, entry_dir));
            }
        }

        if fix {
            let mut state = self.state.lock().expect("cache state poisoned");
            for (name, entry_dir) in corrupted_dirs {
                if let Err(e) = entry_dir.remove_dir_all() {
                    debug!("failed to remove corrupted entry {entry_dir}: {e}");
                    continue;
                }
                // The directory name is the key, modulo a collision-race
                // suffix.
                let key = name.split('-').next().unwrap_or(&name);
                if let Some(entry) = state.index.remove(key) {
                    state.statistics.record_eviction(entry.size);
                }
                report.removed += 1;
            }
            self.persist_index(&state);
            self.persist_statistics(&state);
        }

        Ok(report)
    }

    fn entry_dir(&self, key: &str) -> AbsoluteSystemPathBuf {
        let rel = self.relative_entry_dir(key);
        self.resolve_entry_dir(&rel)
    }

    fn relative_entry_dir(&self, key: &str) -> String {
        let state = self.state.lock().expect("cache state poisoned");
        state
            .index
            .get(key)
            .map(|entry| entry.entry_dir.clone())
            .unwrap_or_else(|| format!("entries/{key}"))
    }

    fn resolve_entry_dir(&self, relative: &str) -> AbsoluteSystemPathBuf {
        match AnchoredSystemPathBuf::from_raw(relative) {
            Ok(anchored) => self.root.resolve(&anchored),
            // An index entry pointing outside the root is treated as the
            // default location; lookups will simply miss.
            Err(_) => self.entries_dir.join_component(relative),
        }
    }

    fn record_miss(&self) {
        let mut state = self.state.lock().expect("cache state poisoned");
        state.statistics.record_miss();
        self.persist_statistics(&state);
    }

    fn persist_index(&self, state: &State) {
        if let Err(e) = state.index.save(&self.root.join_component("index.json")) {
            debug!("failed to persist cache index: {e}");
        }
    }

    fn persist_statistics(&self, state: &State) {
        if let Err(e) = state
            .statistics
            .save(&self.root.join_component("statistics.json"))
        {
            debug!("failed to persist cache statistics: {e}");
        }
    }
}

fn entry_is_intact(entry_dir: &AbsoluteSystemPath) -> bool {
    let manifest_path = entry_dir.join_component("manifest.json");
    let raw = match manifest_path.read_existing_to_string() {
        Ok(Some(raw)) => raw,
        _ => return false,
    };
    let manifest = match CacheManifest::from_json(&raw) {
        Ok(manifest) => manifest,
        Err(_) => return false,
    };

    let outputs_dir = entry_dir.join_component("outputs");
    manifest.outputs.iter().all(|output| {
        outputs_dir
            .resolve(&output.path)
            .read()
            .map(|contents| hash_bytes(&contents) == output.hash)
            .unwrap_or(false)
    })
}

fn file_mode(path: &AbsoluteSystemPath) -> Result<u32, CacheError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(path.stat()?.permissions().mode())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(0o644)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
