mod builder;
mod dot;
mod execute;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

pub use builder::{BuilderError, EngineBuilder};
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution, VisitorData};
use petgraph::Graph;
use sail_task_id::TaskId;

use crate::task_config::TaskDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task_id) => task_id.fmt(f),
        }
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The task graph for one run. Edges point dependent -> dependency; the
/// pseudo root node anchors tasks with no dependencies so the graph always
/// has a single sink.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId<'static>, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId<'static>, Arc<TaskDefinition>>,
    /// Scheduling priority per task, filled in at seal time.
    weights: HashMap<TaskId<'static>, u64>,
    /// Transitive command-running dependencies per task, filled in at seal
    /// time.
    leaf_dependencies: HashMap<TaskId<'static>, HashSet<TaskId<'static>>>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
            weights: HashMap::default(),
            leaf_dependencies: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    pub fn add_definition(
        &mut self,
        task_id: TaskId<'static>,
        definition: Arc<TaskDefinition>,
    ) -> Option<Arc<TaskDefinition>> {
        self.task_definitions.insert(task_id, definition)
    }

    pub fn task_graph_mut(&mut self) -> &mut Graph<TaskNode, ()> {
        &mut self.task_graph
    }

    /// Seals the graph from mutation and derives the scheduling metadata:
    /// weights (a task's own cost plus the weight of everything it unblocks)
    /// and each task's transitive leaf dependencies. The graph must already
    /// be validated acyclic.
    pub fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
            ..
        } = self;

        let order = petgraph::algo::toposort(&task_graph, None)
            .expect("task graph must be validated before sealing");

        // Dependents come before dependencies in `order`, which is exactly
        // the order weights accumulate in.
        let mut weights: HashMap<TaskId<'static>, u64> = task_definitions
            .iter()
            .map(|(task_id, definition)| (task_id.clone(), u64::from(definition.weight_hint)))
            .collect();
        for &index in &order {
            let TaskNode::Task(task_id) = &task_graph[index] else {
                continue;
            };
            let weight = weights.get(task_id).copied().unwrap_or(1);
            for dep_index in task_graph.neighbors_directed(index, petgraph::Direction::Outgoing) {
                if let TaskNode::Task(dep_id) = &task_graph[dep_index] {
                    *weights.entry(dep_id.clone()).or_insert(1) += weight;
                }
            }
        }

        // Leaf dependency sets union bottom-up, so walk dependencies first.
        let mut leaf_dependencies: HashMap<TaskId<'static>, HashSet<TaskId<'static>>> =
            HashMap::new();
        for &index in order.iter().rev() {
            let TaskNode::Task(task_id) = &task_graph[index] else {
                continue;
            };
            let mut leaves = HashSet::new();
            for dep_index in task_graph.neighbors_directed(index, petgraph::Direction::Outgoing) {
                let TaskNode::Task(dep_id) = &task_graph[dep_index] else {
                    continue;
                };
                let dep_runs_command = task_definitions
                    .get(dep_id)
                    .map(|definition| definition.script)
                    .unwrap_or(false);
                if dep_runs_command {
                    leaves.insert(dep_id.clone());
                }
                if let Some(transitive) = leaf_dependencies.get(dep_id) {
                    leaves.extend(transitive.iter().cloned());
                }
            }
            leaf_dependencies.insert(task_id.clone(), leaves);
        }

        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
            weights,
            leaf_dependencies,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    pub fn task_definition(&self, task_id: &TaskId) -> Option<Arc<TaskDefinition>> {
        self.task_definitions.get(task_id).cloned()
    }

    pub fn weight(&self, task_id: &TaskId) -> u64 {
        self.weights.get(task_id).copied().unwrap_or(1)
    }

    pub fn leaf_dependencies(&self, task_id: &TaskId<'static>) -> Option<&HashSet<TaskId<'static>>> {
        self.leaf_dependencies.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.task_graph.node_weights()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.task_lookup.keys()
    }

    pub fn len(&self) -> usize {
        self.task_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_lookup.is_empty()
    }
}
