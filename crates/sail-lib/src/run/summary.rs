//! Execution accounting: per-task events for the progress UI and the final
//! run summary.

use std::sync::Mutex;

use sail_task_id::TaskId;
use serde::Serialize;

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskResult {
    /// Ran its command to a zero exit code.
    Succeeded,
    /// Command exited non-zero, or the incremental check itself failed.
    Failed,
    /// Done-file matched; nothing ran.
    UpToDate,
    /// Outputs replayed from the shared cache.
    CachedHit,
    /// A dependency failed, or the run was canceled before this task ran.
    Skipped,
}

impl TaskResult {
    /// Whether downstream tasks may proceed.
    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            TaskResult::Succeeded | TaskResult::UpToDate | TaskResult::CachedHit
        )
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Success,
    /// Every task was either up to date or replayed from cache.
    UpToDate,
    Failed,
}

/// Streamed to the caller's progress UI as tasks start and finish.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: TaskId<'static>,
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum TaskEventKind {
    Started {
        queue_wait_ms: u64,
    },
    /// Captured command output, or a replay of cached output when
    /// `replayed` is set.
    Output {
        stdout: String,
        stderr: String,
        replayed: bool,
    },
    Finished {
        result: TaskResult,
        elapsed_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub result: TaskResult,
    pub elapsed_ms: u64,
    pub queue_wait_ms: u64,
}

/// One failed task, with enough context to print a useful failure report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: TaskId<'static>,
    pub command: String,
    pub exit_code: i32,
    pub stderr_tail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub total: usize,
    pub up_to_date: usize,
    pub cached: usize,
    pub built: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub status: RunStatus,
    pub counts: TaskCounts,
    pub tasks: Vec<TaskSummary>,
    pub failures: Vec<TaskFailure>,
}

/// Collects task results as they land; shared across the visitor's task
/// futures.
#[derive(Default)]
pub struct SummaryBuilder {
    state: Mutex<SummaryState>,
}

#[derive(Default)]
struct SummaryState {
    tasks: Vec<TaskSummary>,
    failures: Vec<TaskFailure>,
}

const STDERR_TAIL_LINES: usize = 20;

impl SummaryBuilder {
    pub fn record(&self, summary: TaskSummary) {
        self.state
            .lock()
            .expect("summary state poisoned")
            .tasks
            .push(summary);
    }

    pub fn record_failure(
        &self,
        task_id: TaskId<'static>,
        command: &str,
        exit_code: i32,
        stderr: &str,
    ) {
        let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL_LINES).collect();
        let stderr_tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
        self.state
            .lock()
            .expect("summary state poisoned")
            .failures
            .push(TaskFailure {
                task_id,
                command: command.to_string(),
                exit_code,
                stderr_tail,
            });
    }

    pub fn finish(self) -> ExecutionSummary {
        let SummaryState {
            mut tasks,
            failures,
        } = self.state.into_inner().expect("summary state poisoned");
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let mut counts = TaskCounts {
            total: tasks.len(),
            ..TaskCounts::default()
        };
        for task in &tasks {
            match task.result {
                TaskResult::Succeeded => counts.built += 1,
                TaskResult::Failed => counts.failed += 1,
                TaskResult::UpToDate => counts.up_to_date += 1,
                TaskResult::CachedHit => counts.cached += 1,
                TaskResult::Skipped => counts.skipped += 1,
            }
        }

        let status = if counts.failed > 0 || counts.skipped > 0 {
            RunStatus::Failed
        } else if counts.total > 0 && counts.up_to_date + counts.cached == counts.total {
            RunStatus::UpToDate
        } else {
            RunStatus::Success
        };

        ExecutionSummary {
            status,
            counts,
            tasks,
            failures,
        }
    }
}
