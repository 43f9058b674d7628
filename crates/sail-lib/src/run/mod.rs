//! Orchestrates one run: resolve definitions, assemble the task graph,
//! execute it, and report the summary.

pub mod cache;
pub mod done_file;
pub mod summary;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

pub use cache::{CacheCheckResult, RunCache, TaskCache};
pub use done_file::{DoneFile, FileHashEntry};
use sail_cache::{AsyncCacheStore, CacheConfig, CacheStore};
use sail_hash::FileHashCache;
use sail_task_id::TaskName;
pub use summary::{ExecutionSummary, RunStatus, TaskEvent, TaskResult};
use tokio::sync::mpsc;

use crate::{
    engine::{BuilderError, Engine, EngineBuilder},
    opts::Opts,
    package_graph::{resolve_dependencies, PackageGraph, PackageName, ResolutionError},
    process::ProcessManager,
    signal::SignalHandler,
    task_config::{resolve_task_definitions, ConfigError, RawTaskDefinition, TaskDefinition},
    task_graph::{Visitor, VisitorError},
};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error("failed to open cache: {0}")]
    Cache(#[from] sail_cache::CacheError),
    #[error(transparent)]
    Visitor(#[from] VisitorError),
}

pub struct Run {
    package_graph: Arc<PackageGraph>,
    global_config: BTreeMap<String, RawTaskDefinition>,
    opts: Opts,
    event_sender: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl Run {
    pub fn new(
        package_graph: PackageGraph,
        global_config: BTreeMap<String, RawTaskDefinition>,
        opts: Opts,
    ) -> Self {
        Self {
            package_graph: Arc::new(package_graph),
            global_config,
            opts,
            event_sender: None,
        }
    }

    /// Streams per-task progress events to the given channel.
    pub fn with_event_sender(mut self, sender: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    /// Builds the task graph and drains it. The signal handler is the run's
    /// cancellation input: interrupting it stops dispatch and terminates
    /// in-flight commands.
    pub async fn run(&self, signal: SignalHandler) -> Result<ExecutionSummary, RunError> {
        let tasks: Vec<TaskName<'static>> = self
            .opts
            .run_opts
            .tasks
            .iter()
            .map(|task| TaskName::from(task.clone()))
            .collect();

        let matched = self.package_graph.matched_packages();
        if matched.is_empty() || tasks.is_empty() {
            return Ok(summary::SummaryBuilder::default().finish());
        }

        let nodes = resolve_dependencies(&self.package_graph, &matched, |package, dependency| {
            package.release_group == dependency.release_group
        })?;

        let mut definitions: HashMap<PackageName, BTreeMap<String, TaskDefinition>> =
            HashMap::new();
        for name in nodes.keys() {
            let info = self
                .package_graph
                .package_info(name)
                .expect("resolved nodes come from the package graph");
            definitions.insert(
                name.clone(),
                resolve_task_definitions(info, &self.global_config, &tasks)?,
            );
        }

        let engine = EngineBuilder::new(&self.package_graph, &nodes, &definitions)
            .with_tasks(tasks)
            .with_matched_only(self.opts.run_opts.matched_only)
            .build()?;
        let engine: Arc<Engine> = Arc::new(engine);

        // Dry runs must not touch the shared cache; a restore would mutate
        // package outputs.
        let cache = match (&self.opts.cache_opts.cache_root, self.opts.run_opts.dry_run) {
            (Some(cache_root), false) => {
                let store = CacheStore::new(
                    cache_root,
                    CacheConfig {
                        max_size_bytes: self.opts.cache_opts.max_size_bytes,
                        verify_integrity: self.opts.cache_opts.verify_integrity,
                    },
                )?;
                Some(AsyncCacheStore::new(store, self.opts.cache_opts.workers))
            }
            _ => None,
        };
        let run_cache = Arc::new(RunCache::new(
            cache,
            self.opts.run_opts.force,
            self.opts.cache_opts.skip_writes,
        ));

        let visitor = Visitor::new(
            engine,
            self.package_graph.clone(),
            run_cache.clone(),
            Arc::new(FileHashCache::new()),
            ProcessManager::new(),
            self.opts.clone(),
            signal,
            self.event_sender.clone(),
        );
        let summary = visitor.visit().await?;

        run_cache.shutdown().await;

        Ok(summary)
    }
}
