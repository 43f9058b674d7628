//! The per-task skip decision: local done-file first, shared cache second.
//!
//! `RunCache` holds the run-wide pieces (the cache handle and the read/write
//! switches); `task_cache` specializes it per leaf task. All cache failures
//! degrade: a broken lookup or restore becomes a miss, a failed store is
//! logged and forgotten. Nothing in here can fail a build.

use std::sync::Arc;

use sail_cache::{AsyncCacheStore, StoreRequest};
use sail_hash::{hash_bytes, FileHashCache, MISSING_FILE_HASH};
use sail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use sail_task_id::TaskId;
use tracing::{debug, warn};

use super::done_file::{done_file_path, DoneFile, DoneFileError, FileHashEntry};
use crate::{task_config::TaskDefinition, task_hash::CacheKeyInputs};

/// Commands that must never be replayed from cache, no matter what the task
/// definition says. Publishes have external effects a restore can't repeat.
const CACHE_DENY_LIST: &[&str] = &["publish"];

pub struct RunCache {
    cache: Option<AsyncCacheStore>,
    /// `force`: ignore done-files and cache reads, rerun everything.
    reads_disabled: bool,
    /// `skip_cache_write`: read-only cache.
    writes_disabled: bool,
}

impl RunCache {
    pub fn new(cache: Option<AsyncCacheStore>, force: bool, skip_cache_write: bool) -> Self {
        Self {
            cache,
            reads_disabled: force,
            writes_disabled: skip_cache_write,
        }
    }

    pub fn cache(&self) -> Option<&AsyncCacheStore> {
        self.cache.as_ref()
    }

    /// Drains pending cache writes; called once at the end of a run.
    pub async fn shutdown(&self) {
        if let Some(cache) = &self.cache {
            cache.wait_for_writes().await;
        }
    }

    pub fn task_cache(
        self: &Arc<Self>,
        task_id: TaskId<'static>,
        package_dir: AbsoluteSystemPathBuf,
        definition: Arc<TaskDefinition>,
        command: String,
        lockfile_hash: String,
    ) -> TaskCache {
        let done_file = done_file_path(&package_dir, task_id.task());
        let executable = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        let mut key_inputs = CacheKeyInputs::new(task_id.package(), task_id.task());
        key_inputs.executable = executable;
        key_inputs.command = command.clone();
        key_inputs.lockfile_hash = lockfile_hash;

        let caching_disabled = !definition.cache;

        TaskCache {
            run_cache: self.clone(),
            task_id,
            package_dir,
            definition,
            command,
            done_file,
            key_inputs,
            caching_disabled,
        }
    }
}

/// The skip/store logic for one leaf task.
pub struct TaskCache {
    run_cache: Arc<RunCache>,
    task_id: TaskId<'static>,
    package_dir: AbsoluteSystemPathBuf,
    definition: Arc<TaskDefinition>,
    command: String,
    done_file: AbsoluteSystemPathBuf,
    key_inputs: CacheKeyInputs,
    caching_disabled: bool,
}

/// Outcome of the pre-execution check. The done-file rides along because
/// its fingerprint feeds the dependency hashes of downstream tasks.
pub enum CacheCheckResult {
    /// The done-file matches the current inputs and outputs.
    UpToDate { done: DoneFile },
    /// The shared cache had the outputs; they have been restored and the
    /// done-file rewritten. Captured output is replayed by the caller.
    CachedHit {
        stdout: String,
        stderr: String,
        time_saved_ms: u64,
        done: DoneFile,
    },
    /// The task has to run.
    Miss(CacheMiss),
}

/// State carried from the check to `on_success`, so input hashing happens
/// once.
pub struct CacheMiss {
    cache_key: Option<String>,
    src_hashes: Vec<FileHashEntry>,
    dep_hash: Option<String>,
}

impl TaskCache {
    pub fn task_id(&self) -> &TaskId<'static> {
        &self.task_id
    }

    /// Runs the incremental check: done-file comparison, then shared cache
    /// lookup and restore.
    pub async fn check(
        &self,
        file_hashes: &FileHashCache,
        dep_hash: Option<String>,
    ) -> CacheCheckResult {
        let src_hashes = self
            .hash_globs(&self.definition.inputs, Some(file_hashes))
            .await;
        let dst_hashes = self.hash_globs(&self.definition.outputs, None).await;

        let mut candidate = DoneFile::new(src_hashes.clone(), dst_hashes);
        candidate.dep_hash = dep_hash.clone();
        candidate.command_line = self.command_line();

        if !self.run_cache.reads_disabled {
            match DoneFile::read(&self.done_file) {
                Ok(Some(existing)) if existing == candidate => {
                    return CacheCheckResult::UpToDate { done: candidate };
                }
                Ok(_) => {}
                Err(e) => debug!("failed reading done-file for {}: {e}", self.task_id),
            }
        }

        let cache_key = self.is_cacheable().then(|| self.cache_key(&src_hashes));

        if !self.run_cache.reads_disabled {
            if let (Some(cache), Some(key)) = (self.run_cache.cache(), cache_key.as_deref()) {
                match self.try_restore(cache, key, &src_hashes, &dep_hash).await {
                    Ok(Some(result)) => return result,
                    Ok(None) => {}
                    Err(e) => {
                        // Restore trouble downgrades to a miss.
                        debug!("cache restore for {} failed: {e}", self.task_id);
                    }
                }
            }
        }

        CacheCheckResult::Miss(CacheMiss {
            cache_key,
            src_hashes,
            dep_hash,
        })
    }

    /// Post-execution bookkeeping for an exit-code-zero run: rehash outputs,
    /// write the done-file, and queue a cache store. Returns the written
    /// done-file so the caller can record its fingerprint for dependents.
    pub async fn on_success(
        &self,
        miss: CacheMiss,
        stdout: String,
        stderr: String,
        execution_time_ms: u64,
    ) -> Result<DoneFile, DoneFileError> {
        let dst_hashes = self.hash_globs(&self.definition.outputs, None).await;
        let mut done = DoneFile::new(miss.src_hashes, dst_hashes);
        done.dep_hash = miss.dep_hash;
        done.command_line = self.command_line();
        done.write(&self.done_file)?;

        if self.run_cache.writes_disabled {
            return Ok(done);
        }
        if let (Some(cache), Some(key)) = (self.run_cache.cache(), miss.cache_key) {
            cache
                .store(StoreRequest {
                    key,
                    package_dir: self.package_dir.clone(),
                    outputs: self.expand_outputs(),
                    stdout,
                    stderr,
                    execution_time_ms,
                })
                .await;
        }

        Ok(done)
    }

    fn command_line(&self) -> Option<String> {
        (!self.command.is_empty()).then(|| self.command.clone())
    }

    fn cache_key(&self, src_hashes: &[FileHashEntry]) -> String {
        let mut inputs = self.key_inputs.clone();
        inputs.input_hashes = src_hashes
            .iter()
            .map(|entry| (entry.name.clone(), entry.hash.clone()))
            .collect();
        inputs.key()
    }

    /// A task is cacheable unless its definition opts out, it declares no
    /// outputs, or its command is deny-listed.
    fn is_cacheable(&self) -> bool {
        if self.caching_disabled || self.definition.outputs.is_empty() {
            return false;
        }
        !CACHE_DENY_LIST
            .iter()
            .any(|denied| self.command.contains(denied))
    }

    async fn try_restore(
        &self,
        cache: &AsyncCacheStore,
        key: &str,
        src_hashes: &[FileHashEntry],
        dep_hash: &Option<String>,
    ) -> Result<Option<CacheCheckResult>, sail_cache::CacheError> {
        let Some(manifest) = cache.lookup(key)? else {
            return Ok(None);
        };
        cache.restore(&manifest, &self.package_dir)?;

        // Rehash the restored outputs so the done-file records exactly what
        // is on disk; this keeps the dependent fingerprints identical to the
        // original build.
        let dst_hashes = self.hash_globs(&self.definition.outputs, None).await;
        let mut done = DoneFile::new(src_hashes.to_vec(), dst_hashes);
        done.dep_hash = dep_hash.clone();
        done.command_line = self.command_line();
        if let Err(e) = done.write(&self.done_file) {
            warn!("failed writing done-file after restore for {}: {e}", self.task_id);
        }

        Ok(Some(CacheCheckResult::CachedHit {
            stdout: manifest.stdout.clone(),
            stderr: manifest.stderr.clone(),
            time_saved_ms: manifest.execution_time_ms,
            done,
        }))
    }

    /// Hashes the files selected by `globs`, relative to the package
    /// directory. Literal (glob-free) paths always produce an entry, with
    /// the `"<missing>"` sentinel when absent; patterns only match files
    /// that exist. Inputs go through the per-run hash cache; outputs are
    /// always rehashed because tasks rewrite them mid-run.
    async fn hash_globs(
        &self,
        globs: &[String],
        file_hashes: Option<&FileHashCache>,
    ) -> Vec<FileHashEntry> {
        let mut entries = Vec::new();
        for name in expand_globs(&self.package_dir, globs) {
            let path = self.package_dir.join_components(
                &name.split('/').collect::<Vec<_>>(),
            );
            let hash = match file_hashes {
                Some(cache) => cache.hash(&path).await,
                None => hash_file_fresh(&path),
            };
            entries.push(FileHashEntry { name, hash });
        }
        entries
    }

    fn expand_outputs(&self) -> Vec<AnchoredSystemPathBuf> {
        expand_globs(&self.package_dir, &self.definition.outputs)
            .into_iter()
            .filter_map(|name| {
                let path = self
                    .package_dir
                    .join_components(&name.split('/').collect::<Vec<_>>());
                if !path.is_file() {
                    return None;
                }
                AnchoredSystemPathBuf::from_raw(&name).ok()
            })
            .collect()
    }
}

fn hash_file_fresh(path: &AbsoluteSystemPath) -> String {
    match path.read() {
        Ok(contents) => hash_bytes(&contents),
        Err(_) => MISSING_FILE_HASH.to_string(),
    }
}

fn is_literal(glob: &str) -> bool {
    !glob.contains(['*', '?', '[', '{'])
}

/// Expands a list of globs into sorted, deduplicated package-relative file
/// names (forward slashes).
fn expand_globs(package_dir: &AbsoluteSystemPath, globs: &[String]) -> Vec<String> {
    let mut names = Vec::new();
    let mut patterns = Vec::new();
    for glob in globs {
        // Inputs and outputs are contained to the package by contract.
        if glob.split('/').any(|component| component == "..") {
            warn!("ignoring glob escaping the package directory: {glob}");
            continue;
        }
        if is_literal(glob) {
            names.push(glob.clone());
        } else {
            patterns.push(glob.clone());
        }
    }

    if !patterns.is_empty() {
        match globwalk::GlobWalkerBuilder::from_patterns(package_dir.as_std_path(), &patterns)
            .follow_links(false)
            .build()
        {
            Ok(walker) => {
                for entry in walker.into_iter().filter_map(Result::ok) {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if let Ok(relative) = entry.path().strip_prefix(package_dir.as_std_path()) {
                        let name = relative
                            .components()
                            .map(|component| component.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        names.push(name);
                    }
                }
            }
            Err(e) => warn!("invalid glob set {patterns:?}: {e}"),
        }
    }

    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod test {
    use sail_cache::{CacheConfig, CacheStore};

    use super::*;
    use crate::task_config::TaskDefinition;

    fn leaf_definition(inputs: &[&str], outputs: &[&str]) -> Arc<TaskDefinition> {
        Arc::new(TaskDefinition {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            ..TaskDefinition::default()
        })
    }

    fn task_cache(
        run_cache: &Arc<RunCache>,
        package_dir: &AbsoluteSystemPathBuf,
        definition: Arc<TaskDefinition>,
    ) -> TaskCache {
        run_cache.task_cache(
            TaskId::new("a", "build").into_owned(),
            package_dir.clone(),
            definition,
            "echo hi".to_string(),
            MISSING_FILE_HASH.to_string(),
        )
    }

    fn write(package_dir: &AbsoluteSystemPathBuf, rel: &str, contents: &str) {
        let path = package_dir.join_components(&rel.split('/').collect::<Vec<_>>());
        path.ensure_dir().unwrap();
        path.create_with_contents(contents).unwrap();
    }

    #[tokio::test]
    async fn test_miss_then_up_to_date() -> anyhow::Result<()> {
        let package = tempfile::tempdir()?;
        let package_dir = AbsoluteSystemPathBuf::from_std_path(package.path())?;
        write(&package_dir, "src/index.ts", "export {}");

        let run_cache = Arc::new(RunCache::new(None, false, false));
        let cache = task_cache(
            &run_cache,
            &package_dir,
            leaf_definition(&["src/**"], &["out.txt"]),
        );
        let file_hashes = FileHashCache::new();

        let result = cache.check(&file_hashes, None).await;
        let CacheCheckResult::Miss(miss) = result else {
            panic!("expected first check to miss");
        };

        write(&package_dir, "out.txt", "built");
        cache
            .on_success(miss, String::new(), String::new(), 5)
            .await?;

        // Same inputs, same outputs: up to date. A fresh hash cache mimics a
        // new run.
        let fresh_hashes = FileHashCache::new();
        assert!(matches!(
            cache.check(&fresh_hashes, None).await,
            CacheCheckResult::UpToDate { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_input_edit_invalidates() -> anyhow::Result<()> {
        let package = tempfile::tempdir()?;
        let package_dir = AbsoluteSystemPathBuf::from_std_path(package.path())?;
        write(&package_dir, "src/index.ts", "export {}");

        let run_cache = Arc::new(RunCache::new(None, false, false));
        let cache = task_cache(
            &run_cache,
            &package_dir,
            leaf_definition(&["src/**"], &["out.txt"]),
        );

        let CacheCheckResult::Miss(miss) = cache.check(&FileHashCache::new(), None).await else {
            panic!("expected miss");
        };
        write(&package_dir, "out.txt", "built");
        cache
            .on_success(miss, String::new(), String::new(), 5)
            .await?;

        write(&package_dir, "src/index.ts", "export default 1");
        assert!(matches!(
            cache.check(&FileHashCache::new(), None).await,
            CacheCheckResult::Miss(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_hit_restores_outputs() -> anyhow::Result<()> {
        let package = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        let package_dir = AbsoluteSystemPathBuf::from_std_path(package.path())?;
        let cache_root = AbsoluteSystemPathBuf::from_std_path(cache_dir.path())?;
        write(&package_dir, "src/index.ts", "export {}");

        let store = CacheStore::new(&cache_root, CacheConfig::default())?;
        let run_cache = Arc::new(RunCache::new(
            Some(AsyncCacheStore::new(store, 2)),
            false,
            false,
        ));
        let cache = task_cache(
            &run_cache,
            &package_dir,
            leaf_definition(&["src/**"], &["out.txt"]),
        );

        let CacheCheckResult::Miss(miss) = cache.check(&FileHashCache::new(), None).await else {
            panic!("expected miss");
        };
        write(&package_dir, "out.txt", "built");
        cache
            .on_success(miss, "hello".into(), String::new(), 40)
            .await?;
        run_cache.shutdown().await;

        // Lose the local state, keep the shared cache.
        package_dir.join_component("out.txt").remove_file()?;
        package_dir
            .join_components(&[super::super::done_file::DONE_FILE_DIR])
            .remove_dir_all()?;

        let result = cache.check(&FileHashCache::new(), None).await;
        let CacheCheckResult::CachedHit {
            stdout,
            time_saved_ms,
            ..
        } = result
        else {
            panic!("expected cached hit");
        };
        assert_eq!(stdout, "hello");
        assert_eq!(time_saved_ms, 40);
        assert_eq!(
            package_dir.join_component("out.txt").read_to_string()?,
            "built"
        );

        // And the rewritten done-file makes the next check up to date.
        assert!(matches!(
            cache.check(&FileHashCache::new(), None).await,
            CacheCheckResult::UpToDate { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_force_reruns() -> anyhow::Result<()> {
        let package = tempfile::tempdir()?;
        let package_dir = AbsoluteSystemPathBuf::from_std_path(package.path())?;
        write(&package_dir, "src/index.ts", "export {}");

        let run_cache = Arc::new(RunCache::new(None, false, false));
        let cache = task_cache(
            &run_cache,
            &package_dir,
            leaf_definition(&["src/**"], &["out.txt"]),
        );
        let CacheCheckResult::Miss(miss) = cache.check(&FileHashCache::new(), None).await else {
            panic!("expected miss");
        };
        write(&package_dir, "out.txt", "built");
        cache
            .on_success(miss, String::new(), String::new(), 5)
            .await?;

        // Same state, but force disables every skip path.
        let forced = Arc::new(RunCache::new(None, true, false));
        let cache = task_cache(
            &forced,
            &package_dir,
            leaf_definition(&["src/**"], &["out.txt"]),
        );
        assert!(matches!(
            cache.check(&FileHashCache::new(), None).await,
            CacheCheckResult::Miss(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_dep_hash_change_invalidates() -> anyhow::Result<()> {
        let package = tempfile::tempdir()?;
        let package_dir = AbsoluteSystemPathBuf::from_std_path(package.path())?;

        let run_cache = Arc::new(RunCache::new(None, false, false));
        let cache = task_cache(
            &run_cache,
            &package_dir,
            leaf_definition(&[], &["out.txt"]),
        );

        let CacheCheckResult::Miss(miss) =
            cache.check(&FileHashCache::new(), Some("dep-a".into())).await
        else {
            panic!("expected miss");
        };
        write(&package_dir, "out.txt", "built");
        cache
            .on_success(miss, String::new(), String::new(), 5)
            .await?;

        assert!(matches!(
            cache.check(&FileHashCache::new(), Some("dep-a".into())).await,
            CacheCheckResult::UpToDate { .. }
        ));
        assert!(matches!(
            cache.check(&FileHashCache::new(), Some("dep-b".into())).await,
            CacheCheckResult::Miss(_)
        ));
        Ok(())
    }

    #[test]
    fn test_literal_outputs_get_missing_sentinel() {
        let package = tempfile::tempdir().unwrap();
        let package_dir = AbsoluteSystemPathBuf::from_std_path(package.path()).unwrap();
        let names = expand_globs(&package_dir, &["out.txt".to_string()]);
        assert_eq!(names, vec!["out.txt"]);
    }

    #[test]
    fn test_deny_list() {
        let package = tempfile::tempdir().unwrap();
        let package_dir = AbsoluteSystemPathBuf::from_std_path(package.path()).unwrap();
        let run_cache = Arc::new(RunCache::new(None, false, false));

        let cache = run_cache.task_cache(
            TaskId::new("a", "release").into_owned(),
            package_dir.clone(),
            leaf_definition(&[], &["dist/**"]),
            "npm publish".to_string(),
            MISSING_FILE_HASH.to_string(),
        );
        assert!(!cache.is_cacheable());

        let cache = run_cache.task_cache(
            TaskId::new("a", "build").into_owned(),
            package_dir,
            leaf_definition(&[], &["dist/**"]),
            "tsc -p .".to_string(),
            MISSING_FILE_HASH.to_string(),
        );
        assert!(cache.is_cacheable());
    }
}
