//! Task data model for the build graph.
//!
//! A task wraps one transform invocation: which transform, which inputs,
//! where its output lands, and which tasks must finish before it starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::ProjectPaths;

/// Unique name of a task within a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(pub String);

impl TaskName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Directory an output target is relative to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRoot {
    /// The pipeline output directory (`dist`).
    #[default]
    Output,
    /// The project root; used by derived side outputs written into sources.
    Project,
}

/// A task declaration, as written in `kiln.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Registered transform kind (`copy`, `concat`, `command`, `font-manifest`).
    pub kind: String,
    /// Input globs, relative to the project root or to `reads_output_of`'s output.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Globs removed from the resolved input set.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Output directory relative to `output_root`.
    #[serde(default)]
    pub output: String,
    /// Files of the output directory this task owns. `None` owns the subtree.
    #[serde(default)]
    pub owns: Option<String>,
    #[serde(default)]
    pub output_root: OutputRoot,
    /// Predecessors that must succeed first.
    #[serde(default)]
    pub after: Vec<String>,
    /// Resolve inputs against this task's output directory. Implies `after`.
    #[serde(default)]
    pub reads_output_of: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Only part of production builds.
    #[serde(default)]
    pub release: bool,
    /// An empty input set is not an error.
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(default)]
    pub options: toml::Table,
}

impl TaskSpec {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            inputs: Vec::new(),
            exclude: Vec::new(),
            output: String::new(),
            owns: None,
            output_root: OutputRoot::Output,
            after: Vec::new(),
            reads_output_of: None,
            group: None,
            release: false,
            allow_empty: false,
            options: toml::Table::new(),
        }
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude<I, S>(mut self, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = exclude.into_iter().map(Into::into).collect();
        self
    }

    pub fn output(mut self, dir: &str, owns: Option<&str>) -> Self {
        self.output = dir.to_string();
        self.owns = owns.map(str::to_string);
        self
    }

    pub fn output_root(mut self, root: OutputRoot) -> Self {
        self.output_root = root;
        self
    }

    pub fn after<I, S>(mut self, after: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after = after.into_iter().map(Into::into).collect();
        self
    }

    pub fn reads_output_of(mut self, task: &str) -> Self {
        self.reads_output_of = Some(task.to_string());
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn release(mut self) -> Self {
        self.release = true;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    pub fn option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

/// Where a task writes, and which files there it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub root: OutputRoot,
    pub dir: PathBuf,
    pub owns: Option<String>,
}

impl OutputTarget {
    /// Absolute directory this target writes into.
    pub fn resolve(&self, paths: &ProjectPaths) -> PathBuf {
        match self.root {
            OutputRoot::Output => paths.output.join(&self.dir),
            OutputRoot::Project => paths.root.join(&self.dir),
        }
    }

    /// Whether `self` and `other` may write the same file.
    ///
    /// Same directory: overlap unless both own distinct patterns. Owned
    /// patterns are compared for equality; a literal file name is also tested
    /// against the other pattern. Nested directories: overlap when the outer
    /// target owns its whole subtree or a recursive pattern.
    pub fn overlaps(&self, other: &OutputTarget, paths: &ProjectPaths) -> bool {
        let a = self.resolve(paths);
        let b = other.resolve(paths);

        if a == b {
            return owned_patterns_overlap(self.owns.as_deref(), other.owns.as_deref());
        }
        if b.starts_with(&a) {
            return owns_subtree(self.owns.as_deref());
        }
        if a.starts_with(&b) {
            return owns_subtree(other.owns.as_deref());
        }
        false
    }
}

impl std::fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = match self.root {
            OutputRoot::Output => "<output>",
            OutputRoot::Project => "<project>",
        };
        let dir = self.dir.display().to_string();
        let dir = if dir.is_empty() { ".".to_string() } else { dir };
        match &self.owns {
            Some(owns) => write!(f, "{}/{}/{}", root, dir, owns),
            None => write!(f, "{}/{}/**", root, dir),
        }
    }
}

fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?', '[', '{'])
}

fn owns_subtree(owns: Option<&str>) -> bool {
    match owns {
        None => true,
        Some(p) => p.contains("**") || p.contains('/'),
    }
}

/// Whether two owned-file patterns in one directory may name the same file.
///
/// Two wildcard patterns only conflict when they are equal: `*.css` and
/// `*.min.css` count as distinct even though both match `style.min.css`.
/// A literal name conflicts with any pattern that matches it.
fn owned_patterns_overlap(a: Option<&str>, b: Option<&str>) -> bool {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return true,
    };
    if a == b {
        return true;
    }
    let matches = |pattern: &str, name: &str| {
        crate::inputs::compile(pattern)
            .map(|m| m.is_match(name))
            .unwrap_or(false)
    };
    (is_literal(b) && matches(a, b)) || (is_literal(a) && matches(b, a))
}

/// How one task depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Declared ordering (`after`).
    Ordering,
    /// The dependent reads the predecessor's output (`reads_output_of`).
    ReadsOutput,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Ordering => write!(f, "after"),
            DependencyType::ReadsOutput => write!(f, "reads output"),
        }
    }
}

/// A validated task inside the graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: TaskName,
    pub spec: TaskSpec,
    pub output: OutputTarget,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec) -> Self {
        let output = OutputTarget {
            root: spec.output_root,
            dir: PathBuf::from(&spec.output),
            owns: spec.owns.clone(),
        };
        Self {
            name: TaskName::new(spec.name.clone()),
            spec,
            output,
        }
    }

    pub fn kind(&self) -> &str {
        &self.spec.kind
    }

    pub fn group(&self) -> Option<&str> {
        self.spec.group.as_deref()
    }

    pub fn is_release(&self) -> bool {
        self.spec.release
    }

    /// Names this task must wait for, in declaration order, without duplicates.
    pub fn predecessor_names(&self) -> Vec<(TaskName, DependencyType)> {
        let mut names: Vec<(TaskName, DependencyType)> = Vec::new();
        if let Some(src) = &self.spec.reads_output_of {
            names.push((TaskName::new(src.clone()), DependencyType::ReadsOutput));
        }
        for name in &self.spec.after {
            if !names.iter().any(|(n, _)| n.as_str() == name) {
                names.push((TaskName::new(name.clone()), DependencyType::Ordering));
            }
        }
        names
    }
}

/// Final state of a task in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskOutcome {
    Succeeded {
        /// Files the transform produced.
        files: Vec<PathBuf>,
    },
    Failed {
        error: String,
    },
    /// Never started because a predecessor failed.
    Skipped {
        /// The failed ancestor.
        cause: TaskName,
    },
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Succeeded { files } => write!(f, "ok ({} files)", files.len()),
            TaskOutcome::Failed { error } => write!(f, "failed: {}", error),
            TaskOutcome::Skipped { cause } => write!(f, "skipped (after {} failed)", cause),
        }
    }
}

/// Outcome of one task plus its timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: TaskName,
    pub outcome: TaskOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskReport {
    pub fn skipped(name: TaskName, cause: TaskName) -> Self {
        Self {
            name,
            outcome: TaskOutcome::Skipped { cause },
            started_at: None,
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Succeeded { .. })
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Skipped { .. })
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }
}
