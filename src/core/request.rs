//! Run requests: which part of the graph one invocation executes.

use serde::{Deserialize, Serialize};

use crate::core::task::TaskName;

/// Selection of tasks for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "tasks")]
pub enum RunScope {
    /// Every task of the graph.
    All,
    /// The entries plus all of their transitive predecessors.
    Closure(Vec<TaskName>),
    /// Exactly the entries; predecessors outside the set count as satisfied.
    Exact(Vec<TaskName>),
    /// Members of a group plus their transitive predecessors.
    Group(String),
}

/// A request to execute part of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub scope: RunScope,
    /// Include release-only tasks in `All` and `Group` scopes.
    pub release: bool,
}

impl RunRequest {
    /// The whole graph, as a development build.
    pub fn all() -> Self {
        Self {
            scope: RunScope::All,
            release: false,
        }
    }

    /// The whole graph including minified variants.
    pub fn release() -> Self {
        Self {
            scope: RunScope::All,
            release: true,
        }
    }

    pub fn closure<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskName>,
    {
        Self {
            scope: RunScope::Closure(entries.into_iter().map(Into::into).collect()),
            release: false,
        }
    }

    pub fn exact<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskName>,
    {
        Self {
            scope: RunScope::Exact(entries.into_iter().map(Into::into).collect()),
            release: false,
        }
    }

    pub fn group(name: &str) -> Self {
        Self {
            scope: RunScope::Group(name.to_string()),
            release: false,
        }
    }

    pub fn with_release(mut self, release: bool) -> Self {
        self.release = release;
        self
    }
}

impl std::fmt::Display for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let join = |names: &[TaskName]| {
            names
                .iter()
                .map(TaskName::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match &self.scope {
            RunScope::All => write!(f, "all tasks")?,
            RunScope::Closure(names) => write!(f, "{} (with predecessors)", join(names))?,
            RunScope::Exact(names) => write!(f, "{}", join(names))?,
            RunScope::Group(group) => write!(f, "group {}", group)?,
        }
        if self.release {
            write!(f, " [release]")?;
        }
        Ok(())
    }
}
