//! The executor body: receives ready tasks from the engine, applies the
//! task state machine, and runs commands.
//!
//! State machine per task: pending until the engine emits it, then either
//! skipped (a dependency failed or the run was canceled), satisfied without
//! work (done-file match or cache restore), or run to a terminal
//! succeeded/failed. A task failure never stops unrelated work; it only
//! fails the run's overall status and skips the failed task's dependents.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::Instant,
};

use futures::{stream::FuturesUnordered, StreamExt};
use regex::Regex;
use sail_hash::{hash_bytes, FileHashCache, MISSING_FILE_HASH};
use sail_paths::AbsoluteSystemPathBuf;
use sail_task_id::TaskId;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
    engine::{Engine, ExecutionOptions, Message, StopExecution, TaskNode, VisitorData},
    opts::Opts,
    package_graph::{PackageGraph, PackageName},
    process::ProcessManager,
    run::{
        cache::{CacheCheckResult, RunCache, TaskCache},
        summary::{
            ExecutionSummary, SummaryBuilder, TaskEvent, TaskEventKind, TaskResult, TaskSummary,
        },
    },
    signal::SignalHandler,
    task_config::TaskDefinition,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error("could not find definition for task {0}")]
    MissingDefinition(TaskId<'static>),
    #[error("task {task_id} ({command}) looks like it invokes sail and might cause a loop")]
    RecursiveSail {
        task_id: TaskId<'static>,
        command: String,
    },
    #[error("error while executing engine: {0}")]
    Engine(#[from] crate::engine::ExecuteError),
}

fn sail_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)sail(?:\s|$)").expect("sail regex should compile"))
}

/// Holds the run-wide context every task needs.
pub struct Visitor {
    engine: Arc<Engine>,
    package_graph: Arc<PackageGraph>,
    run_cache: Arc<RunCache>,
    file_hashes: Arc<FileHashCache>,
    manager: ProcessManager,
    opts: Opts,
    signal: SignalHandler,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

/// Terminal results and fingerprints, shared across task futures.
#[derive(Default)]
struct TaskTracker {
    results: Mutex<HashMap<TaskId<'static>, TaskResult>>,
    fingerprints: Mutex<HashMap<TaskId<'static>, String>>,
}

impl TaskTracker {
    fn record(&self, task_id: TaskId<'static>, result: TaskResult) {
        self.results
            .lock()
            .expect("task tracker poisoned")
            .insert(task_id, result);
    }

    fn result(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.results
            .lock()
            .expect("task tracker poisoned")
            .get(task_id)
            .copied()
    }

    fn record_fingerprint(&self, task_id: TaskId<'static>, fingerprint: String) {
        self.fingerprints
            .lock()
            .expect("task tracker poisoned")
            .insert(task_id, fingerprint);
    }

    fn fingerprint(&self, task_id: &TaskId) -> Option<String> {
        self.fingerprints
            .lock()
            .expect("task tracker poisoned")
            .get(task_id)
            .cloned()
    }
}

/// Everything one task's future needs, resolved on the visit loop before
/// spawning.
struct TaskContext {
    task_id: TaskId<'static>,
    queue_wait_ms: u64,
    callback: oneshot::Sender<Result<(), StopExecution>>,
    definition: Arc<TaskDefinition>,
    package_dir: AbsoluteSystemPathBuf,
    lockfile_path: Option<AbsoluteSystemPathBuf>,
    command: Option<String>,
    dependencies: Vec<TaskId<'static>>,
    children: Vec<TaskId<'static>>,
}

impl Visitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<Engine>,
        package_graph: Arc<PackageGraph>,
        run_cache: Arc<RunCache>,
        file_hashes: Arc<FileHashCache>,
        manager: ProcessManager,
        opts: Opts,
        signal: SignalHandler,
        events: Option<mpsc::UnboundedSender<TaskEvent>>,
    ) -> Self {
        Self {
            engine,
            package_graph,
            run_cache,
            file_hashes,
            manager,
            opts,
            signal,
            events,
        }
    }

    pub async fn visit(self) -> Result<ExecutionSummary, Error> {
        let concurrency = self.opts.run_opts.concurrency.max(1);
        let (node_sender, mut node_stream) = mpsc::channel(concurrency);

        let engine_handle = {
            let engine = self.engine.clone();
            tokio::spawn(engine.execute(ExecutionOptions::new(concurrency), node_sender))
        };

        // Cancellation kills in-flight subprocesses; queued tasks observe
        // the signal themselves and drain as skipped.
        let signal_watcher = {
            let mut interrupted = self.signal.subscribe();
            let manager = self.manager.clone();
            tokio::spawn(async move {
                if interrupted.wait_for(|interrupted| *interrupted).await.is_ok() {
                    manager.stop();
                }
            })
        };

        let tracker = Arc::new(TaskTracker::default());
        let summary = Arc::new(SummaryBuilder::default());
        let mut tasks = FuturesUnordered::new();

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            let VisitorData {
                task_id,
                queued_for,
            } = info;

            let context = self.task_context(task_id, queued_for.as_millis() as u64, callback)?;
            let visitor = VisitorHandles {
                run_cache: self.run_cache.clone(),
                file_hashes: self.file_hashes.clone(),
                manager: self.manager.clone(),
                signal: self.signal.clone(),
                tracker: tracker.clone(),
                summary: summary.clone(),
                events: self.events.clone(),
                dry_run: self.opts.run_opts.dry_run,
            };
            tasks.push(tokio::spawn(visitor.process(context)));
        }

        engine_handle.await.expect("engine execution panicked")?;
        while let Some(result) = tasks.next().await {
            result.expect("task future panicked");
        }
        signal_watcher.abort();

        let mut summary = Arc::try_unwrap(summary)
            .unwrap_or_else(|_| panic!("summary still shared after drain"))
            .finish();
        // A dry run reports would-run tasks as skipped; that's a report, not
        // a failure.
        if self.opts.run_opts.dry_run
            && summary.counts.failed == 0
            && summary.status == crate::run::summary::RunStatus::Failed
        {
            summary.status = crate::run::summary::RunStatus::Success;
        }
        Ok(summary)
    }

    fn task_context(
        &self,
        task_id: TaskId<'static>,
        queue_wait_ms: u64,
        callback: oneshot::Sender<Result<(), StopExecution>>,
    ) -> Result<TaskContext, Error> {
        let package_name = PackageName::from(task_id.package());
        let package = self
            .package_graph
            .package_info(&package_name)
            .ok_or_else(|| Error::MissingPackage {
                package_name: package_name.clone(),
                task_id: task_id.clone(),
            })?;
        let definition = self
            .engine
            .task_definition(&task_id)
            .ok_or_else(|| Error::MissingDefinition(task_id.clone()))?;

        let command = package.scripts.get(task_id.task()).cloned();

        // A script that invokes sail itself would recurse straight back
        // into this run; abort rather than spin.
        if let Some(command) = &command {
            if sail_regex().is_match(command) {
                return Err(Error::RecursiveSail {
                    task_id,
                    command: command.clone(),
                });
            }
        }

        let dependencies: Vec<TaskId<'static>> = self
            .engine
            .dependencies(&task_id)
            .into_iter()
            .flatten()
            .filter_map(|node| match node {
                TaskNode::Task(dep_id) => Some(dep_id.clone()),
                TaskNode::Root => None,
            })
            .collect();

        let children: Vec<TaskId<'static>> = definition
            .children
            .iter()
            .map(|child| {
                TaskId::from_owned(task_id.package().to_string(), child.task().to_string())
            })
            .collect();

        Ok(TaskContext {
            task_id,
            queue_wait_ms,
            callback,
            definition,
            package_dir: package.dir.clone(),
            lockfile_path: package.lockfile_path.clone(),
            command,
            dependencies,
            children,
        })
    }
}

/// The clones handed to each spawned task future.
struct VisitorHandles {
    run_cache: Arc<RunCache>,
    file_hashes: Arc<FileHashCache>,
    manager: ProcessManager,
    signal: SignalHandler,
    tracker: Arc<TaskTracker>,
    summary: Arc<SummaryBuilder>,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
    dry_run: bool,
}

impl VisitorHandles {
    async fn process(self, context: TaskContext) {
        let started = Instant::now();
        let task_id = context.task_id.clone();

        let (result, stop) = self.process_inner(&context, started).await;

        self.tracker.record(task_id.clone(), result);
        self.summary.record(TaskSummary {
            task_id: task_id.clone(),
            result,
            elapsed_ms: started.elapsed().as_millis() as u64,
            queue_wait_ms: context.queue_wait_ms,
        });
        self.emit(TaskEvent {
            task_id,
            kind: TaskEventKind::Finished {
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
        });

        let response = if stop { Err(StopExecution) } else { Ok(()) };
        if context.callback.send(response).is_err() {
            debug!("engine dropped callback receiver before task result was sent");
        }
    }

    /// Returns the task's terminal result and whether the engine should
    /// stop scheduling new tasks.
    async fn process_inner(
        &self,
        context: &TaskContext,
        started: Instant,
    ) -> (TaskResult, bool) {
        if self.signal.is_interrupted() {
            return (TaskResult::Skipped, true);
        }

        // The walker guarantees every dependency reached a terminal state
        // before this task was emitted.
        let dep_results: Vec<(TaskId<'static>, Option<TaskResult>)> = context
            .dependencies
            .iter()
            .map(|dep_id| (dep_id.clone(), self.tracker.result(dep_id)))
            .collect();
        let any_dep_blocked = dep_results
            .iter()
            .any(|(_, result)| !result.map(|result| result.is_successful()).unwrap_or(false));
        if any_dep_blocked {
            return (TaskResult::Skipped, false);
        }

        if context.definition.is_group() {
            return (self.finish_group(context, &dep_results), false);
        }

        let Some(command) = context.command.clone() else {
            // A task definition with no matching script has nothing to run.
            return (TaskResult::UpToDate, false);
        };

        let dep_hash = self.dependency_hash(&dep_results);
        let lockfile_hash = match &context.lockfile_path {
            Some(path) => self.file_hashes.hash(path).await,
            None => MISSING_FILE_HASH.to_string(),
        };
        let task_cache = self.run_cache.task_cache(
            context.task_id.clone(),
            context.package_dir.clone(),
            context.definition.clone(),
            command.clone(),
            lockfile_hash,
        );

        match task_cache.check(&self.file_hashes, dep_hash).await {
            CacheCheckResult::UpToDate { done } => {
                self.tracker
                    .record_fingerprint(context.task_id.clone(), done.fingerprint());
                (TaskResult::UpToDate, false)
            }
            CacheCheckResult::CachedHit {
                stdout,
                stderr,
                done,
                ..
            } => {
                self.emit(TaskEvent {
                    task_id: context.task_id.clone(),
                    kind: TaskEventKind::Output {
                        stdout,
                        stderr,
                        replayed: true,
                    },
                });
                self.tracker
                    .record_fingerprint(context.task_id.clone(), done.fingerprint());
                (TaskResult::CachedHit, false)
            }
            CacheCheckResult::Miss(miss) => {
                if self.dry_run {
                    return (TaskResult::Skipped, false);
                }
                self.execute_command(context, &task_cache, miss, &command, started)
                    .await
            }
        }
    }

    async fn execute_command(
        &self,
        context: &TaskContext,
        task_cache: &TaskCache,
        miss: crate::run::cache::CacheMiss,
        command: &str,
        started: Instant,
    ) -> (TaskResult, bool) {
        self.emit(TaskEvent {
            task_id: context.task_id.clone(),
            kind: TaskEventKind::Started {
                queue_wait_ms: context.queue_wait_ms,
            },
        });

        let max_attempts = context.definition.retries + 1;
        let mut output = None;
        for attempt in 1..=max_attempts {
            match self.manager.run(command, &context.package_dir).await {
                Ok(Some(attempt_output)) => {
                    self.emit(TaskEvent {
                        task_id: context.task_id.clone(),
                        kind: TaskEventKind::Output {
                            stdout: attempt_output.stdout.clone(),
                            stderr: attempt_output.stderr.clone(),
                            replayed: false,
                        },
                    });
                    let failed = attempt_output.exit_code != 0;
                    output = Some(attempt_output);
                    if !failed {
                        break;
                    }
                    if attempt < max_attempts {
                        debug!(
                            "{} failed attempt {attempt} of {max_attempts}, retrying",
                            context.task_id
                        );
                    }
                }
                // Stopped by cancellation mid-run.
                Ok(None) => return (TaskResult::Skipped, true),
                Err(e) => {
                    self.summary.record_failure(
                        context.task_id.clone(),
                        command,
                        -1,
                        &format!("failed to spawn: {e}"),
                    );
                    return (TaskResult::Failed, false);
                }
            }
        }
        let output = output.expect("at least one attempt ran");

        if output.exit_code != 0 {
            self.summary.record_failure(
                context.task_id.clone(),
                command,
                output.exit_code,
                &output.stderr,
            );
            return (TaskResult::Failed, false);
        }

        let execution_time_ms = started.elapsed().as_millis() as u64;
        match task_cache
            .on_success(miss, output.stdout, output.stderr, execution_time_ms)
            .await
        {
            Ok(done) => {
                self.tracker
                    .record_fingerprint(context.task_id.clone(), done.fingerprint());
                (TaskResult::Succeeded, false)
            }
            Err(e) => {
                self.summary.record_failure(
                    context.task_id.clone(),
                    command,
                    -1,
                    &format!("failed to record build state: {e}"),
                );
                (TaskResult::Failed, false)
            }
        }
    }

    /// A group's fingerprint is the concatenation of its children's
    /// fingerprints; its result is up-to-date only if every dependency was
    /// satisfied without running.
    fn finish_group(
        &self,
        context: &TaskContext,
        dep_results: &[(TaskId<'static>, Option<TaskResult>)],
    ) -> TaskResult {
        let mut children = context.children.clone();
        children.sort();
        let fingerprint: String = children
            .iter()
            .filter_map(|child| self.tracker.fingerprint(child))
            .collect();
        self.tracker
            .record_fingerprint(context.task_id.clone(), fingerprint);

        let all_skipped_work = dep_results.iter().all(|(_, result)| {
            matches!(
                result,
                Some(TaskResult::UpToDate) | Some(TaskResult::CachedHit)
            )
        });
        if all_skipped_work {
            TaskResult::UpToDate
        } else {
            TaskResult::Succeeded
        }
    }

    /// Folds the direct dependencies' fingerprints into one hash. `None`
    /// when there is nothing to fingerprint.
    fn dependency_hash(
        &self,
        dep_results: &[(TaskId<'static>, Option<TaskResult>)],
    ) -> Option<String> {
        let mut entries: Vec<(TaskId<'static>, String)> = dep_results
            .iter()
            .filter_map(|(dep_id, _)| {
                self.tracker
                    .fingerprint(dep_id)
                    .map(|fingerprint| (dep_id.clone(), fingerprint))
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort();
        let combined = entries
            .iter()
            .map(|(dep_id, fingerprint)| format!("{dep_id}={fingerprint}"))
            .collect::<Vec<_>>()
            .join("\n");
        Some(hash_bytes(combined.as_bytes()))
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver just means nobody is watching progress.
            events.send(event).ok();
        }
    }
}
