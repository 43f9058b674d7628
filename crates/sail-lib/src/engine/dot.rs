use std::io;

use petgraph::visit::EdgeRef;

use super::{Built, Engine, TaskNode};

impl Engine<Built> {
    /// Renders the task graph in graphviz dot form for `--graph`-style
    /// tooling. Nodes and edges are emitted sorted so the output is stable
    /// across runs. An edge reads dependent -> dependency.
    pub fn dot_graph<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        writeln!(writer, "digraph tasks {{")?;
        writeln!(writer, "\trankdir = \"BT\"")?;

        let mut nodes: Vec<String> = self
            .task_graph
            .node_weights()
            .map(|node| match node {
                TaskNode::Root => format!("\t\"{node}\" [shape = \"point\"]"),
                TaskNode::Task(task_id) => format!("\t\"{task_id}\""),
            })
            .collect();
        nodes.sort();
        for node in nodes {
            writeln!(writer, "{node}")?;
        }

        let mut edges: Vec<String> = self
            .task_graph
            .edge_references()
            .map(|edge| {
                let dependent = &self.task_graph[edge.source()];
                let dependency = &self.task_graph[edge.target()];
                format!("\t\"{dependent}\" -> \"{dependency}\"")
            })
            .collect();
        edges.sort();
        for edge in edges {
            writeln!(writer, "{edge}")?;
        }

        writeln!(writer, "}}")
    }
}
