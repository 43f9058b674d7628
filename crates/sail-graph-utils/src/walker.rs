use std::{collections::HashMap, future::Future, hash::Hash};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::log::trace;

/// A node handed out by the walker, paired with the callback that marks it
/// done. Dependents stay blocked until the callback fires (or is dropped,
/// which counts the same).
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

/// Dependency-ordered traversal of a DAG.
///
/// A single scheduler task runs Kahn's algorithm incrementally: it keeps a
/// count of unfinished dependencies per node, offers every zero-count node
/// to the caller, and decrements dependents as completion callbacks come
/// back. There is no per-node bookkeeping task; the whole walk is one loop
/// over a set of in-progress completion futures.
///
/// The graph must be acyclic and must not change while a walk is running;
/// callers validate before walking.
pub struct Walker {
    cancel: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
}

impl Walker {
    /// Starts walking the graph. Returns the control handle and the stream
    /// of ready nodes; the caller fires each node's done callback to unlock
    /// its dependents.
    pub fn walk<N, G>(graph: G) -> (Self, mpsc::Receiver<WalkMessage<N>>)
    where
        N: Eq + Hash + Copy + Send + 'static,
        G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected,
    {
        // How many dependencies each node still waits on, and who to unlock
        // when a node finishes. Parallel edges count on both sides, so the
        // arithmetic stays consistent.
        let mut blocked_on: HashMap<N, usize> = HashMap::new();
        let mut dependents_of: HashMap<N, Vec<N>> = HashMap::new();
        for node in graph.node_identifiers() {
            let mut dependency_count = 0;
            for dependency in graph.neighbors_directed(node, Direction::Outgoing) {
                dependency_count += 1;
                dependents_of.entry(dependency).or_default().push(node);
            }
            blocked_on.insert(node, dependency_count);
        }

        // One slot per node: every node is offered exactly once, so the
        // scheduler never blocks on a slow caller. The channel constructor
        // rejects zero capacity.
        let capacity = blocked_on.len().max(1);
        let (ready_tx, ready_rx) = mpsc::channel(capacity);
        let (cancel, cancel_rx) = watch::channel(false);

        let scheduler = tokio::spawn(schedule(blocked_on, dependents_of, ready_tx, cancel_rx));

        (Self { cancel, scheduler }, ready_rx)
    }

    /// Stops the walk: nothing new becomes ready. Nodes already offered are
    /// unaffected, and their callbacks become no-ops.
    pub fn cancel(&self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for the scheduler to wind down, typically after a cancel.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        self.scheduler.await
    }
}

/// Ties a node to its completion callback. Defined once so both offer sites
/// produce the same future type for the scheduler's in-progress set.
fn completion_of<N: Send>(node: N, done_rx: oneshot::Receiver<()>) -> impl Future<Output = N> {
    async move {
        // A dropped callback is taken as completion; the distinction only
        // matters to the caller.
        let _ = done_rx.await;
        node
    }
}

async fn schedule<N: Eq + Hash + Copy + Send + 'static>(
    mut blocked_on: HashMap<N, usize>,
    dependents_of: HashMap<N, Vec<N>>,
    ready_tx: mpsc::Sender<WalkMessage<N>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut in_progress = FuturesUnordered::new();

    // Seed with every node that has no dependencies at all.
    let roots: Vec<N> = blocked_on
        .iter()
        .filter_map(|(node, count)| (*count == 0).then_some(*node))
        .collect();
    for node in roots {
        blocked_on.remove(&node);
        let (done_tx, done_rx) = oneshot::channel();
        if ready_tx.send((node, done_tx)).await.is_err() {
            trace!("walk abandoned before all nodes were offered");
            return;
        }
        in_progress.push(completion_of(node, done_rx));
    }

    while !in_progress.is_empty() {
        let finished = tokio::select! {
            // A cancel racing a completion resolves in favor of the cancel.
            biased;
            _ = cancel_rx.changed() => return,
            Some(node) = in_progress.next() => node,
        };

        let mut unlocked = Vec::new();
        for dependent in dependents_of.get(&finished).into_iter().flatten() {
            if let Some(remaining) = blocked_on.get_mut(dependent) {
                *remaining -= 1;
                if *remaining == 0 {
                    unlocked.push(*dependent);
                }
            }
        }
        for node in unlocked {
            blocked_on.remove(&node);
            let (done_tx, done_rx) = oneshot::channel();
            if ready_tx.send((node, done_tx)).await.is_err() {
                trace!("walk abandoned before all nodes were offered");
                return;
            }
            in_progress.push(completion_of(node, done_rx));
        }
    }
}

#[cfg(test)]
mod test {
    use petgraph::Graph;

    use super::*;

    async fn collect_in_order(
        mut ready: mpsc::Receiver<WalkMessage<petgraph::graph::NodeIndex>>,
    ) -> Vec<petgraph::graph::NodeIndex> {
        let mut visited = Vec::new();
        while let Some((index, done)) = ready.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        visited
    }

    #[tokio::test]
    async fn test_emits_in_dependency_order() {
        // a -> b -> c: c must come out first, a last.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (walker, ready) = Walker::walk(&g);
        let visited = collect_in_order(ready).await;
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_multiple_roots_share_a_dependency() {
        // a -> b -> c <- e <- d: two independent chains meeting at c.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        let e = g.add_node("e");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(d, e, ());
        g.add_edge(e, c, ());

        let (walker, ready) = Walker::walk(&g);
        let visited = collect_in_order(ready).await;
        walker.wait().await.unwrap();

        assert_eq!(visited.len(), 5);
        let position = |node| visited.iter().position(|n| *n == node).unwrap();
        assert!(position(c) < position(b));
        assert!(position(b) < position(a));
        assert!(position(c) < position(e));
        assert!(position(e) < position(d));
    }

    #[tokio::test]
    async fn test_stalled_branch_does_not_block_the_other() {
        //     a
        //    / \
        //   b   c
        //    \ /
        //     d
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, d, ());
        g.add_edge(c, d, ());

        let (walker, mut ready) = Walker::walk(&g);

        let (first, first_done) = ready.recv().await.unwrap();
        assert_eq!(first, d);
        first_done.send(()).unwrap();

        // Both branches become ready; hold one open and finish the other.
        let (second, second_done) = ready.recv().await.unwrap();
        let (third, third_done) = ready.recv().await.unwrap();
        assert_eq!(
            [second, third].into_iter().collect::<std::collections::HashSet<_>>(),
            [b, c].into_iter().collect()
        );
        second_done.send(()).unwrap();

        // The join node must not appear while the stalled branch is open.
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), ready.recv()).await;
        assert!(pending.is_err(), "a was offered before both branches finished");

        third_done.send(()).unwrap();
        let (last, last_done) = ready.recv().await.unwrap();
        assert_eq!(last, a);
        last_done.send(()).unwrap();

        assert!(ready.recv().await.is_none());
        walker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_emission() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (walker, mut ready) = Walker::walk(&g);
        let mut visited = Vec::new();
        while let Some((index, done)) = ready.recv().await {
            walker.cancel().unwrap();
            visited.push(index);
            // The scheduler may already be gone once canceled; a dropped
            // callback is equivalent to sending.
            done.send(()).ok();
        }
        assert_eq!(visited, vec![c]);
        walker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_callback_unlocks_dependents() {
        // a -> b: dropping b's callback without sending still releases a.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());

        let (walker, mut ready) = Walker::walk(&g);
        let (first, first_done) = ready.recv().await.unwrap();
        assert_eq!(first, b);
        drop(first_done);

        let (second, second_done) = ready.recv().await.unwrap();
        assert_eq!(second, a);
        second_done.send(()).unwrap();

        assert!(ready.recv().await.is_none());
        walker.wait().await.unwrap();
    }
}
