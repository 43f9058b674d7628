//! The package graph: which packages exist, which workspace dependencies
//! connect them, and which subset the current run starts from.
//!
//! Discovery is the caller's concern; the graph is built from already-loaded
//! [`PackageInfo`] values.

mod resolver;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

use petgraph::graph::{Graph, NodeIndex};
use sail_paths::AbsoluteSystemPathBuf;
use serde::{Deserialize, Serialize};

pub use resolver::{resolve_dependencies, DependencyNode, ResolutionError};

use crate::task_config::RawTaskDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Everything sail knows about one package. Constructed once during
/// discovery and immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: PackageName,
    /// Absolute directory of the package.
    pub dir: AbsoluteSystemPathBuf,
    /// Lockfile governing this package's external dependencies, when one
    /// exists. Its content hash feeds the cache key.
    pub lockfile_path: Option<AbsoluteSystemPathBuf>,
    /// Named script commands, e.g. `"build" -> "tsc -p ."`.
    pub scripts: BTreeMap<String, String>,
    /// Workspace dependencies declared by this package. Names not present in
    /// the graph (external packages) are ignored at graph build time.
    pub dependencies: Vec<PackageName>,
    pub workspace: String,
    pub release_group: String,
    /// Release-group roots get synthesized fan-out tasks when they declare
    /// none of their own.
    pub release_group_root: bool,
    /// Whether the user's package selection includes this package.
    pub matched: bool,
    /// Package-local task definition overrides.
    pub task_overrides: BTreeMap<String, RawTaskDefinition>,
}

impl PackageInfo {
    pub fn new(name: impl Into<PackageName>, dir: AbsoluteSystemPathBuf) -> Self {
        Self {
            name: name.into(),
            dir,
            lockfile_path: None,
            scripts: BTreeMap::new(),
            dependencies: Vec::new(),
            workspace: String::new(),
            release_group: String::new(),
            release_group_root: false,
            matched: false,
            task_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("duplicate package name {0}")]
    DuplicatePackage(PackageName),
    #[error(transparent)]
    InvalidGraph(#[from] sail_graph_utils::Error),
}

/// Immutable for the duration of a run. Edges point dependent -> dependency.
pub struct PackageGraph {
    graph: Graph<PackageName, ()>,
    node_lookup: HashMap<PackageName, NodeIndex>,
    packages: HashMap<PackageName, PackageInfo>,
}

pub struct PackageGraphBuilder {
    packages: Vec<PackageInfo>,
}

impl PackageGraphBuilder {
    pub fn new() -> Self {
        Self {
            packages: Vec::new(),
        }
    }

    pub fn with_package(mut self, package: PackageInfo) -> Self {
        self.packages.push(package);
        self
    }

    pub fn with_packages(mut self, packages: impl IntoIterator<Item = PackageInfo>) -> Self {
        self.packages.extend(packages);
        self
    }

    pub fn build(self) -> Result<PackageGraph, BuildError> {
        let mut graph = Graph::new();
        let mut node_lookup = HashMap::new();
        let mut packages = HashMap::new();

        for package in self.packages {
            if packages.contains_key(&package.name) {
                return Err(BuildError::DuplicatePackage(package.name));
            }
            let index = graph.add_node(package.name.clone());
            node_lookup.insert(package.name.clone(), index);
            packages.insert(package.name.clone(), package);
        }

        for package in packages.values() {
            let from = node_lookup[&package.name];
            for dependency in &package.dependencies {
                // External dependencies aren't part of the workspace graph.
                if let Some(&to) = node_lookup.get(dependency) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        sail_graph_utils::validate_graph(&graph)?;

        Ok(PackageGraph {
            graph,
            node_lookup,
            packages,
        })
    }
}

impl Default for PackageGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageGraph {
    pub fn builder() -> PackageGraphBuilder {
        PackageGraphBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    /// Packages the user's selection matched.
    pub fn matched_packages(&self) -> HashSet<PackageName> {
        self.packages
            .values()
            .filter(|package| package.matched)
            .map(|package| package.name.clone())
            .collect()
    }

    /// Workspace dependencies of `name`, unfiltered.
    pub fn immediate_dependencies(&self, name: &PackageName) -> Option<HashSet<&PackageName>> {
        let index = self.node_lookup.get(name)?;
        Some(
            self.graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
                .map(|index| {
                    self.graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    /// Workspace packages that depend on `name`, unfiltered.
    pub fn immediate_dependents(&self, name: &PackageName) -> Option<HashSet<&PackageName>> {
        let index = self.node_lookup.get(name)?;
        Some(
            self.graph
                .neighbors_directed(*index, petgraph::Direction::Incoming)
                .map(|index| {
                    self.graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    /// All packages reachable from `roots` through dependency edges,
    /// including the roots themselves.
    pub fn transitive_dependencies(&self, roots: &HashSet<PackageName>) -> HashSet<PackageName> {
        let indices = roots
            .iter()
            .filter_map(|name| self.node_lookup.get(name).copied())
            .collect::<Vec<_>>();
        sail_graph_utils::transitive_closure(&self.graph, indices, petgraph::Direction::Outgoing)
            .into_iter()
            .cloned()
            .collect()
    }
}
