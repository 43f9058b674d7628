//! Task definitions and their resolution.
//!
//! A run carries one global task definition map plus optional per-package
//! overrides. [`resolve_task_definitions`] merges the two for a package,
//! expands the `...` splice token, synthesizes fan-out tasks for release
//! group roots, infers group children from script commands, and validates
//! every dependency token.

mod raw;
mod token;

use std::collections::BTreeMap;

pub use raw::{RawSailConfig, RawTaskDefinition};
use sail_task_id::TaskName;
pub use token::{parse as parse_token, DependencyToken};

use crate::{package_graph::PackageInfo, script_parser};

pub const CLEAN_TASK_NAME: &str = "clean";

/// The splice token: inside a package override's dependency list, stands for
/// the corresponding list from the global definition.
pub const ELLIPSIS_TOKEN: &str = "...";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid dependency token '{token}' in task {task}")]
    InvalidToken { token: String, task: String },
    #[error("'...' may only appear in package task overrides, found in global task {task}")]
    EllipsisInGlobal { task: String },
    #[error("package-qualified dependency '{token}' is not allowed in global task {task}")]
    PackageTaskInGlobal { token: String, task: String },
    #[error("wildcard '{token}' may only appear in before/after of task {task}")]
    WildcardInDependsOn { token: String, task: String },
    #[error("task {task} has no script but declares before/after ordering")]
    BeforeAfterWithoutScript { task: String },
    #[error("task {task} declares children explicitly; children are only inferred from scripts")]
    ExplicitChildren { task: String },
}

/// Fully resolved definition for one (package, task) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub depends_on: Vec<String>,
    /// Soft ordering: this task runs before the listed tasks when both are
    /// scheduled.
    pub before: Vec<String>,
    /// Soft ordering: this task runs after the listed tasks when both are
    /// scheduled.
    pub after: Vec<String>,
    /// Child tasks inferred from the script command. Non-empty means this is
    /// a group task.
    pub children: Vec<TaskName<'static>>,
    /// Whether the task executes an actual command.
    pub script: bool,
    /// Input file globs, relative to the package directory.
    pub inputs: Vec<String>,
    /// Output file globs, relative to the package directory.
    pub outputs: Vec<String>,
    pub cache: bool,
    /// Estimated cost used as the base of the scheduling weight.
    pub weight_hint: u32,
    /// Additional attempts after a non-zero exit before the task counts as
    /// failed.
    pub retries: u32,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            before: Vec::new(),
            after: vec![token::ALL_UPSTREAM.to_string()],
            children: Vec::new(),
            script: true,
            inputs: Vec::new(),
            outputs: Vec::new(),
            cache: true,
            weight_hint: 1,
            retries: 0,
        }
    }
}

impl TaskDefinition {
    pub fn is_group(&self) -> bool {
        !self.script && !self.children.is_empty()
    }

    /// Expands a raw definition with the standard defaults. `clean` swaps
    /// the usual `after: ["^*"]` for `before: ["*"]` so it runs ahead of
    /// everything else in its package.
    fn from_raw(name: &str, raw: &RawTaskDefinition) -> Self {
        let script = raw.script.unwrap_or(true);
        let (default_before, default_after) = if !script {
            (Vec::new(), Vec::new())
        } else if name == CLEAN_TASK_NAME {
            (vec![token::ALL_SIBLINGS.to_string()], Vec::new())
        } else {
            (Vec::new(), vec![token::ALL_UPSTREAM.to_string()])
        };

        Self {
            depends_on: raw.depends_on.clone().unwrap_or_default(),
            before: raw.before.clone().unwrap_or(default_before),
            after: raw.after.clone().unwrap_or(default_after),
            children: Vec::new(),
            script,
            inputs: raw.inputs.clone().unwrap_or_default(),
            outputs: raw.outputs.clone().unwrap_or_default(),
            cache: raw.cache.unwrap_or(true),
            weight_hint: raw.weight.unwrap_or(1),
            retries: raw.retries.unwrap_or(0),
        }
    }
}

/// Produces the normalized `task name -> TaskDefinition` map for a package.
///
/// `requested` is the run's task list, used only to synthesize fan-out tasks
/// for release group roots that declare no tasks of their own.
pub fn resolve_task_definitions(
    package: &PackageInfo,
    global: &BTreeMap<String, RawTaskDefinition>,
    requested: &[TaskName<'static>],
) -> Result<BTreeMap<String, TaskDefinition>, ConfigError> {
    validate_global(global)?;

    // Global definitions become the package-level defaults.
    let mut definitions: BTreeMap<String, TaskDefinition> = global
        .iter()
        .map(|(name, raw)| (name.clone(), TaskDefinition::from_raw(name, raw)))
        .collect();

    // Package-local overrides replace them, with `...` splicing in the
    // corresponding global list.
    for (name, raw) in &package.task_overrides {
        let expanded = expand_ellipsis(raw, global.get(name));
        definitions.insert(name.clone(), TaskDefinition::from_raw(name, &expanded));
    }

    if package.release_group_root && package.task_overrides.is_empty() {
        for task in requested {
            let name = task.task().to_string();
            definitions.insert(
                name.clone(),
                TaskDefinition {
                    depends_on: vec![format!("^{name}")],
                    after: Vec::new(),
                    script: false,
                    cache: false,
                    ..TaskDefinition::default()
                },
            );
        }
    }

    infer_children(package, &mut definitions)?;

    for (name, definition) in &definitions {
        validate_definition(name, definition)?;
    }

    Ok(definitions)
}

fn validate_global(global: &BTreeMap<String, RawTaskDefinition>) -> Result<(), ConfigError> {
    for (name, raw) in global {
        for token in raw.dependency_tokens() {
            if token == ELLIPSIS_TOKEN {
                return Err(ConfigError::EllipsisInGlobal { task: name.clone() });
            }
            if token::is_package_qualified(token) {
                return Err(ConfigError::PackageTaskInGlobal {
                    token: token.to_string(),
                    task: name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn expand_ellipsis(
    raw: &RawTaskDefinition,
    global: Option<&RawTaskDefinition>,
) -> RawTaskDefinition {
    let splice = |list: &Option<Vec<String>>, global_list: Option<&Vec<String>>| {
        list.as_ref().map(|tokens| {
            tokens
                .iter()
                .flat_map(|token| {
                    if token == ELLIPSIS_TOKEN {
                        // No global entry means the splice expands to nothing.
                        global_list.cloned().unwrap_or_default()
                    } else {
                        vec![token.clone()]
                    }
                })
                .collect()
        })
    };

    RawTaskDefinition {
        depends_on: splice(
            &raw.depends_on,
            global.and_then(|raw| raw.depends_on.as_ref()),
        ),
        before: splice(&raw.before, global.and_then(|raw| raw.before.as_ref())),
        after: splice(&raw.after, global.and_then(|raw| raw.after.as_ref())),
        ..raw.clone()
    }
}

/// Walks the package's script commands looking for `npm run x` and
/// `concurrently "npm:x*"` forms; matches become the task's children and the
/// task itself stops being a leaf.
fn infer_children(
    package: &PackageInfo,
    definitions: &mut BTreeMap<String, TaskDefinition>,
) -> Result<(), ConfigError> {
    for (script_name, command) in &package.scripts {
        let children = script_parser::parse_children(
            script_name,
            command,
            package.scripts.keys().map(String::as_str),
        );
        if children.is_empty() {
            continue;
        }
        if let Some(definition) = definitions.get_mut(script_name) {
            definition.children = children
                .into_iter()
                .map(|child| TaskName::from(child).into_owned())
                .collect();
            // The wrapper command is not executed; its children are.
            definition.script = false;
        }
    }

    // Raw children are rejected even when inference found none.
    for (name, raw) in &package.task_overrides {
        if raw.children.is_some() {
            return Err(ConfigError::ExplicitChildren { task: name.clone() });
        }
    }

    Ok(())
}

fn validate_definition(name: &str, definition: &TaskDefinition) -> Result<(), ConfigError> {
    for token in &definition.depends_on {
        let parsed = token::parse(token).ok_or_else(|| ConfigError::InvalidToken {
            token: token.clone(),
            task: name.to_string(),
        })?;
        match parsed {
            DependencyToken::AllSiblings | DependencyToken::AllUpstream => {
                return Err(ConfigError::WildcardInDependsOn {
                    token: token.clone(),
                    task: name.to_string(),
                })
            }
            DependencyToken::Ellipsis => {
                // A surviving `...` means it appeared somewhere it couldn't
                // be spliced.
                return Err(ConfigError::InvalidToken {
                    token: token.clone(),
                    task: name.to_string(),
                });
            }
            _ => {}
        }
    }

    if !definition.script
        && definition.children.is_empty()
        && (!definition.before.is_empty() || !definition.after.is_empty())
    {
        return Err(ConfigError::BeforeAfterWithoutScript {
            task: name.to_string(),
        });
    }

    for token in definition.before.iter().chain(&definition.after) {
        let parsed = token::parse(token).ok_or_else(|| ConfigError::InvalidToken {
            token: token.clone(),
            task: name.to_string(),
        })?;
        if parsed == DependencyToken::Ellipsis {
            return Err(ConfigError::InvalidToken {
                token: token.clone(),
                task: name.to_string(),
            });
        }
    }

    Ok(())
}
