//! Expands the matched package set into the nodes a run will operate on.
//!
//! Starting from the matched packages, walks workspace dependency edges
//! restricted by a caller-supplied filter (typically "same release group")
//! and assigns each reached package a topological level such that every
//! dependency edge goes strictly lower -> higher.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{PackageGraph, PackageInfo, PackageName};

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("matched package {0} is not part of the package graph")]
    UnknownPackage(PackageName),
    #[error("dependency cycle involving package {0}")]
    Cycle(PackageName),
}

/// One package's place in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub package: PackageName,
    /// Packages this node depends on, post-filter. Task graph `^name` edges
    /// expand over this list.
    pub dependencies: Vec<PackageName>,
    /// Topological depth: strictly greater than the level of every node
    /// depending on this one.
    pub level: u32,
}

/// Walks the package graph breadth-first from the matched set, keeping only
/// dependency edges the filter admits.
pub fn resolve_dependencies<F>(
    graph: &PackageGraph,
    matched: &HashSet<PackageName>,
    filter: F,
) -> Result<HashMap<PackageName, DependencyNode>, ResolutionError>
where
    F: Fn(&PackageInfo, &PackageInfo) -> bool,
{
    let mut nodes: HashMap<PackageName, DependencyNode> = HashMap::new();
    let mut queue: VecDeque<PackageName> = VecDeque::new();

    for name in matched {
        if graph.package_info(name).is_none() {
            return Err(ResolutionError::UnknownPackage(name.clone()));
        }
        queue.push_back(name.clone());
    }

    while let Some(name) = queue.pop_front() {
        if nodes.contains_key(&name) {
            continue;
        }
        let info = graph
            .package_info(&name)
            .ok_or_else(|| ResolutionError::UnknownPackage(name.clone()))?;

        let mut dependencies: Vec<PackageName> = graph
            .immediate_dependencies(&name)
            .into_iter()
            .flatten()
            .filter(|dependency| {
                graph
                    .package_info(dependency)
                    .map(|dependency_info| filter(info, dependency_info))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        dependencies.sort();

        for dependency in &dependencies {
            queue.push_back(dependency.clone());
        }

        nodes.insert(
            name.clone(),
            DependencyNode {
                package: name,
                dependencies,
                level: 0,
            },
        );
    }

    assign_levels(&mut nodes)?;

    Ok(nodes)
}

/// Longest-path levels via DFS. A back edge means a cycle; the package graph
/// is validated acyclic at build time, so this only fires when the filter is
/// inconsistent with that validation (or the graph was mutated).
fn assign_levels(nodes: &mut HashMap<PackageName, DependencyNode>) -> Result<(), ResolutionError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let names: Vec<PackageName> = nodes.keys().cloned().collect();
    let mut marks: HashMap<PackageName, Mark> = HashMap::new();
    let mut levels: HashMap<PackageName, u32> = HashMap::new();

    fn visit(
        name: &PackageName,
        nodes: &HashMap<PackageName, DependencyNode>,
        marks: &mut HashMap<PackageName, Mark>,
        levels: &mut HashMap<PackageName, u32>,
    ) -> Result<u32, ResolutionError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(levels[name]),
            Some(Mark::InProgress) => return Err(ResolutionError::Cycle(name.clone())),
            None => {}
        }
        marks.insert(name.clone(), Mark::InProgress);

        let dependencies = nodes
            .get(name)
            .map(|node| node.dependencies.clone())
            .unwrap_or_default();
        let mut level = 0;
        for dependency in &dependencies {
            if nodes.contains_key(dependency) {
                level = level.max(visit(dependency, nodes, marks, levels)? + 1);
            }
        }

        marks.insert(name.clone(), Mark::Done);
        levels.insert(name.clone(), level);
        Ok(level)
    }

    for name in &names {
        visit(name, nodes, &mut marks, &mut levels)?;
    }

    // Levels count up from the dependency leaves; flip them so every edge
    // goes strictly lower -> higher from dependents to dependencies.
    let max_level = levels.values().copied().max().unwrap_or(0);
    for (name, node) in nodes.iter_mut() {
        node.level = max_level - levels[name];
    }

    Ok(())
}
