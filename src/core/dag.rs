//! Task graph (directed acyclic graph) for the build pipeline.
//!
//! The graph is built once from the task declarations and validated eagerly:
//! names, predecessors, transform kinds, cycles and output ownership are all
//! checked before any transform runs. After construction it is immutable.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use crate::config::ProjectPaths;
use crate::core::request::{RunRequest, RunScope};
use crate::core::task::{DependencyType, Task, TaskName, TaskSpec};
use crate::error::ConfigError;
use crate::inputs::validate_patterns;
use crate::transform::TransformRegistry;
use crate::{klog_debug, klog_warn};

/// The validated task graph.
///
/// Nodes are tasks; an edge `a -> b` means `a` must succeed before `b` starts.
pub struct TaskGraph {
    graph: DiGraph<Task, DependencyType>,
    task_index: HashMap<TaskName, NodeIndex>,
    paths: ProjectPaths,
}

impl TaskGraph {
    /// Build and validate a graph from declarations.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for empty or duplicate names, unknown
    /// predecessors or transform kinds, invalid options or globs, dependency
    /// cycles, and overlapping output targets.
    pub fn build(
        specs: Vec<TaskSpec>,
        paths: ProjectPaths,
        registry: &TransformRegistry,
    ) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for spec in specs {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            let transform = registry
                .get(&spec.kind)
                .ok_or_else(|| ConfigError::UnknownTransform {
                    task: spec.name.clone(),
                    kind: spec.kind.clone(),
                })?;
            transform
                .validate(&spec.options)
                .map_err(|reason| ConfigError::InvalidOptions {
                    task: spec.name.clone(),
                    reason,
                })?;
            validate_patterns(&spec.inputs)?;
            validate_patterns(&spec.exclude)?;
            if let Some(owns) = &spec.owns {
                validate_patterns(std::slice::from_ref(owns))?;
            }
            if spec.kind == "command" {
                warn_if_missing_program(&spec);
            }

            let task = Task::from_spec(spec);
            if task_index.contains_key(&task.name) {
                return Err(ConfigError::DuplicateTask(task.name.0));
            }
            let name = task.name.clone();
            let index = graph.add_node(task);
            task_index.insert(name, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for (pred, dep_type) in task.predecessor_names() {
                let pred_index =
                    task_index
                        .get(&pred)
                        .ok_or_else(|| ConfigError::MissingPredecessor {
                            task: task.name.0.clone(),
                            missing: pred.0.clone(),
                        })?;
                edges.push((*pred_index, index, dep_type));
            }
        }
        for (from, to, dep_type) in edges {
            graph.add_edge(from, to, dep_type);
        }

        let dag = Self {
            graph,
            task_index,
            paths,
        };
        dag.check_cycles()?;
        dag.check_output_ownership()?;

        klog_debug!(
            "TaskGraph built: {} tasks, {} dependencies",
            dag.task_count(),
            dag.dependency_count()
        );
        Ok(dag)
    }

    fn check_cycles(&self) -> Result<(), ConfigError> {
        for component in tarjan_scc(&self.graph) {
            let is_cycle = component.len() > 1
                || self.graph.contains_edge(component[0], component[0]);
            if !is_cycle {
                continue;
            }
            let members: HashSet<NodeIndex> = component.iter().copied().collect();
            let start = component
                .iter()
                .copied()
                .min_by(|a, b| self.graph[*a].name.cmp(&self.graph[*b].name))
                .unwrap_or(component[0]);
            let path = self
                .cycle_through(start, &members)
                .into_iter()
                .map(|i| self.graph[i].name.0.clone())
                .collect();
            return Err(ConfigError::Cycle { path });
        }
        Ok(())
    }

    /// A concrete cycle `start -> ... -> start` inside a strongly connected component.
    fn cycle_through(&self, start: NodeIndex, members: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
        let mut visited = HashSet::new();
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(start, self.sorted_successors(start))];
        visited.insert(start);

        while let Some((node, mut pending)) = stack.pop() {
            let Some(next) = pending.pop() else {
                continue;
            };
            stack.push((node, pending));
            if next == start {
                let mut path: Vec<NodeIndex> = stack.iter().map(|(n, _)| *n).collect();
                path.push(start);
                return path;
            }
            if members.contains(&next) && visited.insert(next) {
                stack.push((next, self.sorted_successors(next)));
            }
        }
        vec![start, start]
    }

    /// Successors in reverse name order, so popping yields them alphabetically.
    fn sorted_successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self.graph.neighbors_directed(index, Direction::Outgoing).collect();
        next.sort_by(|a, b| self.graph[*b].name.cmp(&self.graph[*a].name));
        next.dedup();
        next
    }

    fn check_output_ownership(&self) -> Result<(), ConfigError> {
        let tasks: Vec<&Task> = self.graph.node_weights().collect();
        for (i, a) in tasks.iter().enumerate() {
            for b in &tasks[i + 1..] {
                if a.output.overlaps(&b.output, &self.paths) {
                    return Err(ConfigError::OutputOverlap {
                        first: a.name.0.clone(),
                        second: b.name.0.clone(),
                        target: b.output.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Get a reference to a task by name.
    pub fn get_task(&self, name: &TaskName) -> Option<&Task> {
        self.task_index
            .get(name)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_node_index(&self, name: &TaskName) -> Option<NodeIndex> {
        self.task_index.get(name).copied()
    }

    /// Task stored at `index`.
    ///
    /// # Panics
    /// If `index` does not belong to this graph.
    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, name: &TaskName) -> bool {
        self.task_index.contains_key(name)
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Check if `from` must finish before `to`.
    pub fn has_dependency(&self, from: &TaskName, to: &TaskName) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    pub fn get_dependency(&self, from: &TaskName, to: &TaskName) -> Option<DependencyType> {
        let a = self.task_index.get(from)?;
        let b = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*a, *b)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Direct predecessors of `index`.
    pub fn predecessors(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    /// Direct dependents of `index`.
    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    /// Names of the direct predecessors of a task, sorted.
    pub fn dependency_names(&self, name: &TaskName) -> Vec<&TaskName> {
        let mut names: Vec<&TaskName> = match self.task_index.get(name) {
            Some(&index) => self.predecessors(index).map(|i| &self.graph[i].name).collect(),
            None => Vec::new(),
        };
        names.sort();
        names.dedup();
        names
    }

    /// Every task reachable from `index` along dependency edges.
    pub fn transitive_dependents(&self, index: NodeIndex) -> BTreeSet<NodeIndex> {
        self.reachable(vec![index], Direction::Outgoing)
    }

    /// Every task `index` transitively waits for.
    pub fn transitive_predecessors(&self, index: NodeIndex) -> BTreeSet<NodeIndex> {
        self.reachable(vec![index], Direction::Incoming)
    }

    fn reachable(&self, start: Vec<NodeIndex>, direction: Direction) -> BTreeSet<NodeIndex> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = start.into_iter().collect();
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, direction) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Distinct group names, sorted.
    pub fn groups(&self) -> Vec<&str> {
        let groups: BTreeSet<&str> = self.graph.node_weights().filter_map(Task::group).collect();
        groups.into_iter().collect()
    }

    /// Tasks in topological order; each task comes after its predecessors.
    pub fn topological_order(&self) -> Vec<&Task> {
        // Acyclicity is checked in `build`, so toposort cannot fail here.
        toposort(&self.graph, None)
            .unwrap_or_default()
            .into_iter()
            .map(|index| &self.graph[index])
            .collect()
    }

    /// Resolve a run request into the set of tasks to execute.
    ///
    /// # Errors
    /// Unknown task or group names are configuration errors.
    pub fn select(&self, request: &RunRequest) -> Result<BTreeSet<NodeIndex>, ConfigError> {
        let include = |index: &NodeIndex| request.release || !self.graph[*index].is_release();

        let selected = match &request.scope {
            RunScope::All => self.graph.node_indices().filter(include).collect(),
            RunScope::Exact(names) => self.lookup(names)?.into_iter().collect(),
            RunScope::Closure(names) => {
                let entries = self.lookup(names)?;
                let mut selected: BTreeSet<NodeIndex> = entries.iter().copied().collect();
                selected.extend(self.reachable(entries, Direction::Incoming));
                selected
            }
            RunScope::Group(group) => {
                let entries: Vec<NodeIndex> = self
                    .graph
                    .node_indices()
                    .filter(|i| self.graph[*i].group() == Some(group.as_str()))
                    .collect();
                if entries.is_empty() {
                    return Err(ConfigError::UnknownGroup(group.clone()));
                }
                let entries: Vec<NodeIndex> = entries.into_iter().filter(include).collect();
                let mut selected: BTreeSet<NodeIndex> = entries.iter().copied().collect();
                selected.extend(self.reachable(entries, Direction::Incoming));
                selected
            }
        };
        Ok(selected)
    }

    fn lookup(&self, names: &[TaskName]) -> Result<Vec<NodeIndex>, ConfigError> {
        names
            .iter()
            .map(|name| {
                self.get_node_index(name)
                    .ok_or_else(|| ConfigError::UnknownTask(name.0.clone()))
            })
            .collect()
    }

    /// Absolute output directory of a task.
    pub fn output_dir(&self, task: &Task) -> PathBuf {
        task.output.resolve(&self.paths)
    }

    /// Base directory input globs of `task` are resolved against.
    pub fn input_base(&self, task: &Task) -> PathBuf {
        task.spec
            .reads_output_of
            .as_ref()
            .and_then(|name| self.get_task(&TaskName::new(name.clone())))
            .map(|source| self.output_dir(source))
            .unwrap_or_else(|| self.paths.root.clone())
    }
}

fn warn_if_missing_program(spec: &TaskSpec) {
    if let Some(program) = spec.options.get("program").and_then(|p| p.as_str()) {
        if which::which(program).is_err() {
            klog_warn!("Task {}: program {} not found on PATH", spec.name, program);
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
