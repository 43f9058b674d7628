//! The options surface of the executor. CLI parsing and flag wiring live
//! outside this crate; callers assemble these structs however they like.

use sail_paths::AbsoluteSystemPathBuf;

#[derive(Debug, Clone, Default)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
}

#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Task names to run. Bare names (`build`) apply to every package in
    /// scope; qualified names (`web#build`) to one.
    pub tasks: Vec<String>,
    /// Maximum number of tasks running at once.
    pub concurrency: usize,
    /// Bypass every skip mechanism and rerun all tasks. Successful runs
    /// still write done-files and cache entries.
    pub force: bool,
    /// Build only the matched packages, not their transitive dependencies.
    pub matched_only: bool,
    /// Walk the graph and report which tasks are already up to date without
    /// executing anything. Tasks that would run are reported as skipped.
    pub dry_run: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            concurrency: default_concurrency(),
            force: false,
            matched_only: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOpts {
    /// Root of the shared cache; `None` disables it entirely.
    pub cache_root: Option<AbsoluteSystemPathBuf>,
    /// Size of the write-behind worker pool.
    pub workers: usize,
    /// Read-only cache: lookups and restores happen, stores don't.
    pub skip_writes: bool,
    /// Rehash restored files against the manifest.
    pub verify_integrity: bool,
    /// Prune threshold. `None` means the cache grows unbounded.
    pub max_size_bytes: Option<u64>,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            cache_root: None,
            workers: 8,
            skip_writes: false,
            verify_integrity: false,
            max_size_bytes: None,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}
