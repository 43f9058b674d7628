//! Drains the task graph through a weight-ordered priority queue.
//!
//! The walker emits tasks as their dependencies complete; ready tasks are
//! buffered in a max-heap keyed by scheduling weight, and the heaviest one
//! is dispatched to the visitor whenever a concurrency permit is free. The
//! visitor answers each message with a result; a `StopExecution` reply
//! cancels the walk without interrupting tasks that are already running.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{stream::FuturesUnordered, StreamExt};
use sail_graph_utils::Walker;
use sail_task_id::TaskId;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::{Engine, TaskNode};

pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

/// What the visitor receives for each dispatched task.
#[derive(Debug)]
pub struct VisitorData {
    pub task_id: TaskId<'static>,
    /// How long the task sat ready in the priority queue before a permit
    /// freed up.
    pub queued_for: Duration,
}

type VisitorResult = Result<(), StopExecution>;

#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("Engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(_: mpsc::error::SendError<Message<VisitorData, VisitorResult>>) -> Self {
        ExecuteError::Visitor
    }
}

/// A task whose dependencies have all completed, waiting for a permit.
struct ReadyTask {
    weight: u64,
    task_id: TaskId<'static>,
    done: oneshot::Sender<()>,
    ready_at: Instant,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Heavier first; ties broken by task id so dispatch order is
        // deterministic.
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyTask {}

impl Engine {
    /// Executes the task graph by sending ready tasks to the visitor,
    /// heaviest first, with at most `concurrency` tasks in flight. The
    /// visitor owns all error handling; the only control it has over the
    /// walk is the `StopExecution` sentinel, which stops scheduling new
    /// tasks without touching running ones.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions { concurrency } = options;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight: FuturesUnordered<
            tokio::task::JoinHandle<Result<(), ExecuteError>>,
        > = FuturesUnordered::new();

        let (walker, mut nodes) = Walker::walk(&self.task_graph);
        let walker = Arc::new(walker);
        let mut ready: BinaryHeap<ReadyTask> = BinaryHeap::new();

        loop {
            // Hand out permits to the heaviest ready tasks first.
            while !ready.is_empty() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let task = ready.pop().expect("heap is non-empty");
                in_flight.push(self.clone().dispatch(
                    task,
                    permit,
                    visitor.clone(),
                    walker.clone(),
                ));
            }

            tokio::select! {
                maybe_node = nodes.recv() => {
                    let Some((node_id, done)) = maybe_node else {
                        break;
                    };
                    match self
                        .task_graph
                        .node_weight(node_id)
                        .expect("node id should be present")
                    {
                        // The pseudo root has no work attached.
                        TaskNode::Root => {
                            if done.send(()).is_err() {
                                debug!("walker done receiver closed before root was marked");
                            }
                        }
                        TaskNode::Task(task_id) => {
                            ready.push(ReadyTask {
                                weight: self.weight(task_id),
                                task_id: task_id.clone(),
                                done,
                                ready_at: Instant::now(),
                            });
                        }
                    }
                }
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    result.expect("task dispatch panicked")?;
                }
            }
        }

        // The node stream only closes once every offered task was marked
        // done or the walk was canceled. Leftover ready tasks can only
        // exist after a cancel; their callbacks are dead, so drop them.
        drop(ready);

        while let Some(result) = in_flight.next().await {
            result.expect("task dispatch panicked")?;
        }

        Ok(())
    }

    fn dispatch(
        self: Arc<Self>,
        task: ReadyTask,
        permit: OwnedSemaphorePermit,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
        walker: Arc<Walker>,
    ) -> tokio::task::JoinHandle<Result<(), ExecuteError>> {
        tokio::spawn(async move {
            let _permit = permit;
            let ReadyTask {
                task_id,
                done,
                ready_at,
                ..
            } = task;

            let (message, result) = Message::new(VisitorData {
                task_id,
                queued_for: ready_at.elapsed(),
            });
            visitor.send(message).await?;

            if let Err(StopExecution) = result.await.unwrap_or_else(|_| {
                // A dropped callback counts as a completed task.
                trace!("visitor dropped callback sender without sending a result");
                Ok(())
            }) {
                if walker.cancel().is_err() {
                    debug!("unable to cancel graph walk");
                }
            }
            if done.send(()).is_err() {
                debug!("walker done receiver closed before task finished");
            }
            Ok(())
        })
    }
}
