//! Task identity types.
//!
//! A `TaskId` is a fully qualified (package, task) pair. A `TaskName` is what
//! appears in configuration: either a bare task name (`build`) or a
//! package-qualified one (`web#build`). Both are `Cow`-backed so parsing
//! borrowed configuration strings does not allocate.

use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

pub const TASK_DELIMITER: &str = "#";

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("'{input}' is not a valid task id, must be of form 'package{TASK_DELIMITER}task'")]
pub struct TaskIdError {
    input: String,
}

/// A task identifier of the form `package#task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

/// A task name as it appears in task definitions, optionally qualified with a
/// package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId<'static> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TaskId::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for TaskName<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskName<'static> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(TaskName::from(raw))
    }
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_owned(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }

    /// The unqualified name of this task, borrowing from this id.
    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl<'a> TryFrom<&'a str> for TaskId<'a> {
    type Error = TaskIdError;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        match value.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() && !task.is_empty() => Ok(TaskId {
                package: package.into(),
                task: task.into(),
            }),
            _ => Err(TaskIdError {
                input: value.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for TaskId<'static> {
    type Error = TaskIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TaskId::try_from(value.as_str()).map(TaskId::into_owned)
    }
}

impl From<TaskId<'_>> for String {
    fn from(value: TaskId<'_>) -> Self {
        value.to_string()
    }
}

impl<'a> TaskName<'a> {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    /// If this name is package-qualified, the corresponding task id.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        let package = self.package.as_deref()?;
        Some(TaskId {
            package: package.into(),
            task: self.task.as_ref().into(),
        })
    }

    pub fn into_owned(self) -> TaskName<'static> {
        let TaskName { package, task } = self;
        TaskName {
            package: package.map(|package| package.into_owned().into()),
            task: task.into_owned().into(),
        }
    }

    /// Strips any package qualifier, leaving the bare task name.
    pub fn into_non_workspace_task(self) -> TaskName<'a> {
        TaskName {
            package: None,
            task: self.task,
        }
    }

    pub fn is_package_qualified(&self) -> bool {
        self.package.is_some()
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => write!(f, "{}", self.task),
        }
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(value: &'a str) -> Self {
        match value.split_once(TASK_DELIMITER) {
            // A leading delimiter is a task name that happens to start with '#',
            // not a package qualifier.
            Some((package, task)) if !package.is_empty() => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
            _ => TaskName {
                package: None,
                task: value.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(value: String) -> Self {
        TaskName::from(value.as_str()).into_owned()
    }
}

impl From<TaskName<'_>> for String {
    fn from(value: TaskName<'_>) -> Self {
        value.to_string()
    }
}

impl<'a> From<TaskId<'a>> for TaskName<'a> {
    fn from(value: TaskId<'a>) -> Self {
        TaskName {
            package: Some(value.package),
            task: value.task,
        }
    }
}
