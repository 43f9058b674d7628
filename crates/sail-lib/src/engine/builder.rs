//! Assembles the task graph for a run.
//!
//! Seeds one task per (in-scope package, requested task name), then expands
//! symbolic dependency edges breadth-first: `name` within the package,
//! `^name` across the package's dependencies, `pkg#name` to an exact task.
//! Group tasks pull their children in as dependencies. Once the hard edges
//! are validated acyclic, `before`/`after` soft edges are layered on top,
//! dropping any edge that would close a cycle.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use itertools::Itertools;
use petgraph::algo::has_path_connecting;
use sail_task_id::{TaskId, TaskName};

#[cfg(test)]
use super::TaskNode;
use super::{Building, Built, Engine};
use crate::{
    package_graph::{DependencyNode, PackageGraph, PackageName},
    task_config::{ConfigError, DependencyToken, TaskDefinition},
};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("could not find task `{0}` in any package in scope")]
    MissingTask(String),
    #[error("missing task definition for {0}")]
    MissingTaskDefinition(String),
    #[error("dependency on unknown task {0}")]
    UnknownPackageTask(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] sail_graph_utils::Error),
}

pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    nodes: &'a HashMap<PackageName, DependencyNode>,
    definitions: &'a HashMap<PackageName, BTreeMap<String, TaskDefinition>>,
    tasks: Vec<TaskName<'static>>,
    matched_only: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        package_graph: &'a PackageGraph,
        nodes: &'a HashMap<PackageName, DependencyNode>,
        definitions: &'a HashMap<PackageName, BTreeMap<String, TaskDefinition>>,
    ) -> Self {
        Self {
            package_graph,
            nodes,
            definitions,
            tasks: Vec::new(),
            matched_only: false,
        }
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// Restricts the graph to the matched packages, leaving out their
    /// transitive dependencies.
    pub fn with_matched_only(mut self, matched_only: bool) -> Self {
        self.matched_only = matched_only;
        self
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        let mut engine: Engine<Building> = Engine::default();
        if self.nodes.is_empty() || self.tasks.is_empty() {
            return Ok(engine.seal());
        }

        let in_scope: Vec<&PackageName> = self
            .nodes
            .keys()
            .filter(|name| {
                !self.matched_only
                    || self
                        .package_graph
                        .package_info(name)
                        .map(|info| info.matched)
                        .unwrap_or(false)
            })
            .sorted()
            .collect();

        // Every requested task has to resolve somewhere, or the run was a
        // typo.
        for task in &self.tasks {
            let found = in_scope
                .iter()
                .any(|package| self.lookup_definition(package, task.task()).is_some());
            if !found {
                return Err(BuilderError::MissingTask(task.to_string()));
            }
        }

        let mut traversal_queue: VecDeque<TaskId<'static>> = VecDeque::new();
        for (package, task) in in_scope.iter().copied().cartesian_product(self.tasks.iter()) {
            match task.package() {
                // A qualified request like `web#build` only seeds that
                // package.
                Some(requested_package) if requested_package != package.as_str() => continue,
                _ => {}
            }
            let task_id = TaskId::from_owned(package.as_str().to_string(), task.task().to_string());
            if self.lookup_definition(package, task.task()).is_some() {
                traversal_queue.push_back(task_id);
            }
        }

        let mut visited: HashSet<TaskId<'static>> = HashSet::new();
        while let Some(task_id) = traversal_queue.pop_front() {
            if !visited.insert(task_id.clone()) {
                continue;
            }

            let package = PackageName::from(task_id.package());
            let definition = self
                .lookup_definition(&package, task_id.task())
                .ok_or_else(|| BuilderError::MissingTaskDefinition(task_id.to_string()))?;

            let task_index = engine.get_index(&task_id);
            let mut has_dependencies = false;

            // A group completes when its children do, so children hang off
            // it as ordinary dependencies.
            for child in &definition.children {
                let child_id =
                    TaskId::from_owned(task_id.package().to_string(), child.task().to_string());
                if self.lookup_definition(&package, child.task()).is_none() {
                    return Err(BuilderError::MissingTaskDefinition(child_id.to_string()));
                }
                let child_index = engine.get_index(&child_id);
                engine.task_graph_mut().add_edge(task_index, child_index, ());
                has_dependencies = true;
                traversal_queue.push_back(child_id);
            }

            for token in &definition.depends_on {
                let token = crate::task_config::parse_token(token).expect("tokens validated");
                match token {
                    DependencyToken::Sibling(name) => {
                        let dep_id =
                            TaskId::from_owned(task_id.package().to_string(), name.clone());
                        if self.lookup_definition(&package, &name).is_none() {
                            return Err(BuilderError::MissingTaskDefinition(dep_id.to_string()));
                        }
                        let dep_index = engine.get_index(&dep_id);
                        engine.task_graph_mut().add_edge(task_index, dep_index, ());
                        has_dependencies = true;
                        traversal_queue.push_back(dep_id);
                    }
                    DependencyToken::Upstream(name) => {
                        for dependency in self.dependency_packages(&package) {
                            if !self.package_in_scope(dependency) {
                                continue;
                            }
                            // Dependency packages that don't define the task
                            // simply don't participate.
                            if self.lookup_definition(dependency, &name).is_none() {
                                continue;
                            }
                            let dep_id =
                                TaskId::from_owned(dependency.as_str().to_string(), name.clone());
                            let dep_index = engine.get_index(&dep_id);
                            engine.task_graph_mut().add_edge(task_index, dep_index, ());
                            has_dependencies = true;
                            traversal_queue.push_back(dep_id);
                        }
                    }
                    DependencyToken::Package(dep_id) => {
                        let dep_package = PackageName::from(dep_id.package());
                        if !self.nodes.contains_key(&dep_package)
                            || self.lookup_definition(&dep_package, dep_id.task()).is_none()
                        {
                            return Err(BuilderError::UnknownPackageTask(dep_id.to_string()));
                        }
                        if !self.package_in_scope(&dep_package) {
                            continue;
                        }
                        let dep_index = engine.get_index(&dep_id);
                        engine.task_graph_mut().add_edge(task_index, dep_index, ());
                        has_dependencies = true;
                        traversal_queue.push_back(dep_id);
                    }
                    DependencyToken::AllSiblings
                    | DependencyToken::AllUpstream
                    | DependencyToken::Ellipsis => {
                        unreachable!("wildcards and splices are rejected during config resolution")
                    }
                }
            }

            engine.add_definition(task_id.clone(), definition);
            if !has_dependencies {
                engine.connect_to_root(&task_id);
            }
        }

        sail_graph_utils::validate_graph(&engine.task_graph)?;

        self.add_soft_edges(&mut engine);

        Ok(engine.seal())
    }

    /// Definition lookup with a fallback: any declared script can be run as
    /// a default leaf task even without explicit configuration. This is how
    /// group children (plain scripts) get definitions.
    fn lookup_definition(
        &self,
        package: &PackageName,
        task: &str,
    ) -> Option<Arc<TaskDefinition>> {
        if let Some(definition) = self
            .definitions
            .get(package)
            .and_then(|definitions| definitions.get(task))
        {
            return Some(Arc::new(definition.clone()));
        }
        let info = self.package_graph.package_info(package)?;
        if info.scripts.contains_key(task) {
            return Some(Arc::new(TaskDefinition::default()));
        }
        None
    }

    fn dependency_packages(&self, package: &PackageName) -> impl Iterator<Item = &PackageName> {
        self.nodes
            .get(package)
            .into_iter()
            .flat_map(|node| node.dependencies.iter())
    }

    fn package_in_scope(&self, package: &PackageName) -> bool {
        if !self.nodes.contains_key(package) {
            return false;
        }
        if !self.matched_only {
            return true;
        }
        self.package_graph
            .package_info(package)
            .map(|info| info.matched)
            .unwrap_or(false)
    }

    /// Applies `before`/`after` ordering edges. These are annotations, not
    /// dependencies: an edge is added only when both endpoints are already
    /// scheduled and skipped entirely when it would close a cycle, so cyclic
    /// orderings quietly collapse instead of failing the build.
    fn add_soft_edges(&self, engine: &mut Engine<Building>) {
        let tasks_by_package: HashMap<PackageName, Vec<TaskId<'static>>> = {
            let mut map: HashMap<PackageName, Vec<TaskId<'static>>> = HashMap::new();
            for task_id in engine.task_lookup.keys().sorted() {
                map.entry(PackageName::from(task_id.package()))
                    .or_default()
                    .push(task_id.clone());
            }
            map
        };

        for task_id in engine.task_lookup.keys().cloned().sorted().collect::<Vec<_>>() {
            let Some(definition) = engine.task_definitions.get(&task_id).cloned() else {
                continue;
            };

            for token in &definition.before {
                let token = crate::task_config::parse_token(token).expect("tokens validated");
                for target in self.resolve_soft_targets(&token, &task_id, &tasks_by_package, engine)
                {
                    // `before` means the target waits on this task.
                    Self::add_soft_edge(engine, &target, &task_id);
                }
            }
            for token in &definition.after {
                let token = crate::task_config::parse_token(token).expect("tokens validated");
                for target in self.resolve_soft_targets(&token, &task_id, &tasks_by_package, engine)
                {
                    // `after` means this task waits on the target.
                    Self::add_soft_edge(engine, &task_id, &target);
                }
            }
        }
    }

    fn resolve_soft_targets(
        &self,
        token: &DependencyToken,
        task_id: &TaskId<'static>,
        tasks_by_package: &HashMap<PackageName, Vec<TaskId<'static>>>,
        engine: &Engine<Building>,
    ) -> Vec<TaskId<'static>> {
        let package = PackageName::from(task_id.package());
        let scheduled = |candidate: &TaskId<'static>| engine.task_lookup.contains_key(candidate);

        match token {
            DependencyToken::Sibling(name) => {
                let candidate = TaskId::from_owned(package.as_str().to_string(), name.clone());
                scheduled(&candidate).then_some(candidate).into_iter().collect()
            }
            DependencyToken::Package(dep_id) => scheduled(dep_id)
                .then(|| dep_id.clone())
                .into_iter()
                .collect(),
            DependencyToken::AllSiblings => tasks_by_package
                .get(&package)
                .into_iter()
                .flatten()
                .filter(|candidate| *candidate != task_id)
                .cloned()
                .collect(),
            DependencyToken::Upstream(name) => self
                .dependency_packages(&package)
                .map(|dependency| {
                    TaskId::from_owned(dependency.as_str().to_string(), name.clone())
                })
                .filter(scheduled)
                .collect(),
            DependencyToken::AllUpstream => self
                .dependency_packages(&package)
                .flat_map(|dependency| {
                    tasks_by_package.get(dependency).into_iter().flatten().cloned()
                })
                .collect(),
            DependencyToken::Ellipsis => {
                unreachable!("splices are rejected during config resolution")
            }
        }
    }

    /// Adds `dependent -> dependency` unless it already exists, is a self
    /// edge, or would close a cycle.
    fn add_soft_edge(
        engine: &mut Engine<Building>,
        dependent: &TaskId<'static>,
        dependency: &TaskId<'static>,
    ) {
        if dependent == dependency {
            return;
        }
        let (Some(&dependent_index), Some(&dependency_index)) = (
            engine.task_lookup.get(dependent),
            engine.task_lookup.get(dependency),
        ) else {
            return;
        };
        if engine
            .task_graph
            .find_edge(dependent_index, dependency_index)
            .is_some()
        {
            return;
        }
        if has_path_connecting(&engine.task_graph, dependency_index, dependent_index, None) {
            return;
        }
        engine
            .task_graph
            .add_edge(dependent_index, dependency_index, ());
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use sail_paths::AbsoluteSystemPathBuf;
    use serde_json::json;

    use super::*;
    use crate::{
        package_graph::{resolve_dependencies, PackageGraph, PackageInfo},
        task_config::{resolve_task_definitions, RawTaskDefinition},
    };

    struct TestRepo {
        package_graph: PackageGraph,
        global: BTreeMap<String, RawTaskDefinition>,
    }

    fn package(name: &str, deps: &[&str]) -> PackageInfo {
        let dir = if cfg!(windows) {
            format!("C:\\repo\\packages\\{name}")
        } else {
            format!("/repo/packages/{name}")
        };
        let mut info = PackageInfo::new(name, AbsoluteSystemPathBuf::new(dir).unwrap());
        info.dependencies = deps.iter().map(|dep| PackageName::from(*dep)).collect();
        info.matched = true;
        info
    }

    fn repo(
        packages: Vec<PackageInfo>,
        global: serde_json::Value,
    ) -> TestRepo {
        let package_graph = PackageGraph::builder()
            .with_packages(packages)
            .build()
            .unwrap();
        let global: BTreeMap<String, RawTaskDefinition> =
            serde_json::from_value(global).unwrap();
        TestRepo {
            package_graph,
            global,
        }
    }

    fn build_engine(repo: &TestRepo, tasks: &[&str]) -> Result<Engine, BuilderError> {
        build_engine_with(repo, tasks, false)
    }

    fn build_engine_with(
        repo: &TestRepo,
        tasks: &[&str],
        matched_only: bool,
    ) -> Result<Engine, BuilderError> {
        let tasks: Vec<TaskName<'static>> = tasks
            .iter()
            .map(|task| TaskName::from(task.to_string()))
            .collect();
        let matched = repo.package_graph.matched_packages();
        let nodes = resolve_dependencies(&repo.package_graph, &matched, |_, _| true).unwrap();
        let definitions: HashMap<PackageName, BTreeMap<String, TaskDefinition>> = nodes
            .keys()
            .map(|name| {
                let info = repo.package_graph.package_info(name).unwrap();
                (
                    name.clone(),
                    resolve_task_definitions(info, &repo.global, &tasks).unwrap(),
                )
            })
            .collect();
        EngineBuilder::new(&repo.package_graph, &nodes, &definitions)
            .with_tasks(tasks)
            .with_matched_only(matched_only)
            .build()
    }

    macro_rules! deps {
        {} => {
            HashMap::new()
        };
        {$($key:expr => $value:expr),* $(,)?} => {
            {
                let mut _map = HashMap::new();
                $(
                let key = TaskId::try_from($key).unwrap();
                let value = $value.iter().copied().map(|x| {
                    if x == "___ROOT___" {
                        TaskNode::Root
                    } else {
                        TaskNode::Task(TaskId::try_from(x).unwrap())
                    }
                }).collect::<HashSet<_>>();
                _map.insert(key, value);
                )*
                _map
            }
        };
    }

    fn all_dependencies(engine: &Engine) -> HashMap<TaskId<'static>, HashSet<TaskNode>> {
        engine
            .task_ids()
            .filter_map(|task_id| {
                let deps = engine.dependencies(task_id)?;
                Some((task_id.clone(), deps.into_iter().cloned().collect()))
            })
            .collect()
    }

    #[test]
    fn test_cross_package_edges() {
        let repo = repo(
            vec![package("a", &[]), package("b", &["a"]), package("c", &["b"])],
            json!({
                "build": { "dependsOn": ["^build"], "after": [] },
            }),
        );
        let engine = build_engine(&repo, &["build"]).unwrap();

        let expected = deps! {
            "a#build" => ["___ROOT___"],
            "b#build" => ["a#build"],
            "c#build" => ["b#build"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_sibling_and_upstream_edges() {
        let repo = repo(
            vec![package("a", &[]), package("b", &["a"])],
            json!({
                "build": { "dependsOn": ["^build", "prepare"], "after": [] },
                "prepare": { "after": [] },
            }),
        );
        let engine = build_engine(&repo, &["build"]).unwrap();

        let expected = deps! {
            "a#build" => ["a#prepare"],
            "a#prepare" => ["___ROOT___"],
            "b#build" => ["a#build", "b#prepare"],
            "b#prepare" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_package_qualified_dependency() {
        let mut codegen = package("codegen", &[]);
        codegen
            .scripts
            .insert("generate".into(), "node generate.js".into());
        let mut app = package("app", &["codegen"]);
        app.task_overrides.insert(
            "build".into(),
            serde_json::from_value(json!({ "dependsOn": ["codegen#generate"], "after": [] }))
                .unwrap(),
        );
        let repo = repo(
            vec![codegen, app],
            json!({ "build": { "after": [] } }),
        );
        let engine = build_engine(&repo, &["build"]).unwrap();

        let deps = engine
            .dependencies(&TaskId::new("app", "build"))
            .unwrap();
        assert!(deps.contains(&TaskNode::Task(TaskId::new("codegen", "generate").into_owned())));
    }

    #[test]
    fn test_unknown_package_task_errors() {
        let mut app = package("app", &[]);
        app.task_overrides.insert(
            "build".into(),
            serde_json::from_value(json!({ "dependsOn": ["ghost#generate"], "after": [] }))
                .unwrap(),
        );
        let repo = repo(vec![app], json!({ "build": { "after": [] } }));
        let result = build_engine(&repo, &["build"]);
        assert!(matches!(result, Err(BuilderError::UnknownPackageTask(_))));
    }

    #[test]
    fn test_missing_requested_task_errors() {
        let repo = repo(vec![package("a", &[])], json!({ "build": {} }));
        let result = build_engine(&repo, &["deploy"]);
        assert!(matches!(result, Err(BuilderError::MissingTask(_))));
    }

    #[test]
    fn test_group_task_children() {
        let mut a = package("a", &[]);
        a.scripts
            .insert("build".into(), "concurrently \"npm:build:*\"".into());
        a.scripts.insert("build:esm".into(), "tsc -m esnext".into());
        a.scripts.insert("build:cjs".into(), "tsc -m commonjs".into());
        let repo = repo(vec![a], json!({ "build": { "after": [] } }));
        let engine = build_engine(&repo, &["build"]).unwrap();

        let deps = engine.dependencies(&TaskId::new("a", "build")).unwrap();
        assert_eq!(
            deps,
            [
                TaskNode::Task(TaskId::new("a", "build:esm").into_owned()),
                TaskNode::Task(TaskId::new("a", "build:cjs").into_owned()),
            ]
            .iter()
            .collect::<HashSet<_>>()
        );

        // Children are leaves with commands; the group runs nothing itself.
        let group = engine
            .task_definition(&TaskId::new("a", "build"))
            .unwrap();
        assert!(group.is_group());
    }

    #[test]
    fn test_dependency_cycle_errors_with_path() {
        // c depends on b depends on a; injecting `a#build -> c#build` closes
        // the loop.
        let mut a = package("a", &[]);
        a.task_overrides.insert(
            "build".into(),
            serde_json::from_value(json!({ "dependsOn": ["c#build"], "after": [] })).unwrap(),
        );
        let repo = repo(
            vec![a, package("b", &["a"]), package("c", &["b"])],
            json!({ "build": { "dependsOn": ["^build"], "after": [] } }),
        );
        let result = build_engine(&repo, &["build"]);
        let err = match result {
            Err(BuilderError::Graph(err)) => err.to_string(),
            other => panic!("expected cycle error, got {other:?}"),
        };
        for task in ["a#build", "b#build", "c#build"] {
            assert!(err.contains(task), "{err}");
        }
    }

    #[test]
    fn test_clean_runs_before_siblings() {
        let mut a = package("a", &[]);
        a.scripts.insert("clean".into(), "rimraf dist".into());
        a.scripts.insert("build".into(), "tsc".into());
        let repo = repo(
            vec![a],
            json!({
                "build": { "after": [] },
                "clean": { "cache": false },
            }),
        );
        let engine = build_engine(&repo, &["build", "clean"]).unwrap();

        // clean declares `before: ["*"]`, so build picks up a soft edge on
        // it.
        let build_deps = engine.dependencies(&TaskId::new("a", "build")).unwrap();
        assert!(build_deps.contains(&TaskNode::Task(TaskId::new("a", "clean").into_owned())));
    }

    #[test]
    fn test_soft_edge_cycles_collapse() {
        let mut a = package("a", &[]);
        a.task_overrides.insert(
            "one".into(),
            serde_json::from_value(json!({ "before": ["two"], "after": [] })).unwrap(),
        );
        a.task_overrides.insert(
            "two".into(),
            serde_json::from_value(json!({ "before": ["one"], "after": [] })).unwrap(),
        );
        a.scripts.insert("one".into(), "echo one".into());
        a.scripts.insert("two".into(), "echo two".into());
        let repo = repo(vec![a], json!({}));
        let engine = build_engine(&repo, &["one", "two"]).unwrap();

        // Exactly one direction survives; the reverse edge would close a
        // cycle and is dropped.
        let one_on_two = engine
            .dependencies(&TaskId::new("a", "one"))
            .unwrap()
            .contains(&TaskNode::Task(TaskId::new("a", "two").into_owned()));
        let two_on_one = engine
            .dependencies(&TaskId::new("a", "two"))
            .unwrap()
            .contains(&TaskNode::Task(TaskId::new("a", "one").into_owned()));
        assert!(one_on_two != two_on_one);
    }

    #[test]
    fn test_default_after_orders_across_packages() {
        let mut lib = package("lib", &[]);
        lib.scripts.insert("lint".into(), "eslint .".into());
        let app = package("app", &["lib"]);
        let repo = repo(
            vec![lib, app],
            json!({
                "build": {},
                "lint": { "after": [] },
            }),
        );
        let engine = build_engine(&repo, &["build", "lint"]).unwrap();

        // app#build has the default `after: ["^*"]`, so it waits on lib's
        // tasks even without a hard dependency.
        let deps = engine.dependencies(&TaskId::new("app", "build")).unwrap();
        assert!(deps.contains(&TaskNode::Task(TaskId::new("lib", "build").into_owned())));
        assert!(deps.contains(&TaskNode::Task(TaskId::new("lib", "lint").into_owned())));
    }

    #[test]
    fn test_matched_only_restricts_scope() {
        let lib = package("lib", &[]);
        let mut app = package("app", &["lib"]);
        app.matched = true;
        let mut lib = lib;
        lib.matched = false;
        let repo = repo(
            vec![lib, app],
            json!({ "build": { "dependsOn": ["^build"], "after": [] } }),
        );
        let engine = build_engine_with(&repo, &["build"], true).unwrap();

        let expected = deps! {
            "app#build" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_weights_favor_unblocking_tasks() {
        // c depends on b depends on a; d is independent. Finishing a
        // unblocks the whole chain, so it outweighs d.
        let repo = repo(
            vec![
                package("a", &[]),
                package("b", &["a"]),
                package("c", &["b"]),
                package("d", &[]),
            ],
            json!({ "build": { "dependsOn": ["^build"], "after": [] } }),
        );
        let engine = build_engine(&repo, &["build"]).unwrap();

        assert_eq!(engine.weight(&TaskId::new("a", "build")), 3);
        assert_eq!(engine.weight(&TaskId::new("b", "build")), 2);
        assert_eq!(engine.weight(&TaskId::new("c", "build")), 1);
        assert_eq!(engine.weight(&TaskId::new("d", "build")), 1);
    }

    #[test]
    fn test_leaf_dependencies_aggregate_through_groups() {
        let mut a = package("a", &[]);
        a.scripts
            .insert("build".into(), "concurrently \"npm:build:*\"".into());
        a.scripts.insert("build:esm".into(), "tsc -m esnext".into());
        a.scripts.insert("build:cjs".into(), "tsc -m commonjs".into());
        let b = package("b", &["a"]);
        let repo = repo(
            vec![a, b],
            json!({ "build": { "dependsOn": ["^build"], "after": [] } }),
        );
        let engine = build_engine(&repo, &["build"]).unwrap();

        let leaves = engine
            .leaf_dependencies(&TaskId::new("b", "build"))
            .unwrap();
        // The group itself is not a leaf; its children are.
        assert_eq!(
            leaves,
            &[
                TaskId::new("a", "build:esm").into_owned(),
                TaskId::new("a", "build:cjs").into_owned(),
            ]
            .into_iter()
            .collect::<HashSet<_>>()
        );
    }
}
