//! Scheduler for parallel task execution.
//!
//! The Scheduler executes the selected part of a [`TaskGraph`] as a dataflow:
//! a task starts as soon as all of its selected predecessors succeeded, up to
//! a `jobs` limit. When a task fails, every task downstream of it is skipped
//! without being started while independent tasks keep running.

use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::core::dag::TaskGraph;
use crate::core::request::RunRequest;
use crate::core::task::{TaskName, TaskOutcome, TaskReport};
use crate::error::{Error, Result};
use crate::inputs::resolve_inputs;
use crate::transform::{TransformContext, TransformRegistry};
use crate::util::blocking;
use crate::{klog, klog_debug, klog_error};

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These let the CLI print live status and the dev server push reloads
/// without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskStarted {
        task: TaskName,
    },
    TaskSucceeded {
        task: TaskName,
        /// Number of files the transform produced.
        files: usize,
        duration: Duration,
    },
    TaskFailed {
        task: TaskName,
        error: String,
    },
    /// A task was not started because `cause` failed.
    TaskSkipped {
        task: TaskName,
        cause: TaskName,
    },
    /// Every selected task reached a final state.
    RunFinished {
        success: bool,
        duration: Duration,
    },
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub request: RunRequest,
    /// One report per selected task, in completion order.
    pub reports: Vec<TaskReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// True when no task failed or was skipped.
    pub fn success(&self) -> bool {
        self.reports.iter().all(TaskReport::succeeded)
    }

    pub fn report(&self, name: &str) -> Option<&TaskReport> {
        self.reports.iter().find(|r| r.name.as_str() == name)
    }

    pub fn failed(&self) -> Vec<&TaskReport> {
        self.reports.iter().filter(|r| r.failed()).collect()
    }

    pub fn skipped(&self) -> Vec<&TaskReport> {
        self.reports.iter().filter(|r| r.is_skipped()).collect()
    }

    pub fn succeeded_count(&self) -> usize {
        self.reports.iter().filter(|r| r.succeeded()).count()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Executes run requests against an immutable task graph.
pub struct Scheduler {
    graph: Arc<TaskGraph>,
    registry: Arc<TransformRegistry>,
    jobs: usize,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

struct Finished {
    index: NodeIndex,
    started_at: DateTime<Utc>,
    result: Result<Vec<PathBuf>>,
}

impl Scheduler {
    pub fn new(graph: Arc<TaskGraph>, registry: Arc<TransformRegistry>) -> Self {
        Self {
            graph,
            registry,
            jobs: 1,
            event_tx: None,
        }
    }

    /// Limit concurrently running tasks. Zero is treated as one.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Execute `request`.
    ///
    /// # Errors
    /// Only configuration problems (unknown task or group) are returned as
    /// errors; task failures are recorded in the [`RunResult`].
    pub async fn run(&self, request: &RunRequest) -> Result<RunResult> {
        let selected = self.graph.select(request)?;
        let started_at = Utc::now();
        klog!("Run started: {} ({} tasks)", request, selected.len());

        // Unfinished selected predecessors per task. Predecessors outside the
        // selection are treated as satisfied.
        let mut waiting: HashMap<NodeIndex, usize> = selected
            .iter()
            .map(|&index| {
                let preds: BTreeSet<NodeIndex> = self
                    .graph
                    .predecessors(index)
                    .filter(|p| selected.contains(p))
                    .collect();
                (index, preds.len())
            })
            .collect();

        let mut ready: BTreeMap<TaskName, NodeIndex> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&index, _)| (self.graph.task(index).name.clone(), index))
            .collect();

        let mut reports: Vec<TaskReport> = Vec::with_capacity(selected.len());
        let mut skipped: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut running: HashMap<tokio::task::Id, (NodeIndex, DateTime<Utc>)> = HashMap::new();
        let mut join_set: JoinSet<Finished> = JoinSet::new();

        loop {
            while running.len() < self.jobs {
                let Some((name, index)) = ready.pop_first() else {
                    break;
                };
                let task_started = Utc::now();
                klog_debug!("Starting task {}", name);
                self.emit(SchedulerEvent::TaskStarted { task: name });
                let work = self.execute(index);
                let handle = join_set.spawn(async move {
                    Finished {
                        index,
                        started_at: task_started,
                        result: work.await,
                    }
                });
                running.insert(handle.id(), (index, task_started));
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };
            let finished = match joined {
                Ok((id, finished)) => {
                    running.remove(&id);
                    finished
                }
                Err(join_error) => {
                    let Some((index, task_started)) = running.remove(&join_error.id()) else {
                        continue;
                    };
                    Finished {
                        index,
                        started_at: task_started,
                        result: Err(Error::TaskJoin(join_error.to_string())),
                    }
                }
            };

            let index = finished.index;
            let name = self.graph.task(index).name.clone();
            let finished_at = Utc::now();
            match finished.result {
                Ok(files) => {
                    let duration = (finished_at - finished.started_at).to_std().unwrap_or_default();
                    klog!("Task {} succeeded: {} files", name, files.len());
                    self.emit(SchedulerEvent::TaskSucceeded {
                        task: name.clone(),
                        files: files.len(),
                        duration,
                    });
                    reports.push(TaskReport {
                        name,
                        outcome: TaskOutcome::Succeeded { files },
                        started_at: Some(finished.started_at),
                        finished_at: Some(finished_at),
                    });

                    for dependent in self.graph.dependents(index) {
                        if skipped.contains(&dependent) {
                            continue;
                        }
                        if let Some(count) = waiting.get_mut(&dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                ready.insert(self.graph.task(dependent).name.clone(), dependent);
                            }
                        }
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    klog_error!("Task {} failed: {}", name, error);
                    self.emit(SchedulerEvent::TaskFailed {
                        task: name.clone(),
                        error: error.clone(),
                    });
                    reports.push(TaskReport {
                        name: name.clone(),
                        outcome: TaskOutcome::Failed { error },
                        started_at: Some(finished.started_at),
                        finished_at: Some(finished_at),
                    });

                    for dependent in self.graph.transitive_dependents(index) {
                        if !selected.contains(&dependent) || !skipped.insert(dependent) {
                            continue;
                        }
                        let dependent_name = self.graph.task(dependent).name.clone();
                        klog!("Task {} skipped: {} failed", dependent_name, name);
                        self.emit(SchedulerEvent::TaskSkipped {
                            task: dependent_name.clone(),
                            cause: name.clone(),
                        });
                        reports.push(TaskReport::skipped(dependent_name, name.clone()));
                    }
                }
            }
        }

        let result = RunResult {
            request: request.clone(),
            reports,
            started_at,
            finished_at: Utc::now(),
        };
        klog!(
            "Run finished: {} ok, {} failed, {} skipped",
            result.succeeded_count(),
            result.failed().len(),
            result.skipped().len()
        );
        self.emit(SchedulerEvent::RunFinished {
            success: result.success(),
            duration: result.duration(),
        });
        Ok(result)
    }

    /// Future running one task's transform on the blocking pool.
    fn execute(&self, index: NodeIndex) -> impl std::future::Future<Output = Result<Vec<PathBuf>>> + Send + 'static {
        let task = self.graph.task(index);
        let transform = self.registry.get(task.kind());
        let name = task.name.clone();
        let kind = task.kind().to_string();
        let base = self.graph.input_base(task);
        let patterns = task.spec.inputs.clone();
        let exclude = task.spec.exclude.clone();
        let allow_empty = task.spec.allow_empty;
        let output_dir = self.graph.output_dir(task);
        let project_root = self.graph.paths().root.clone();
        let options = task.spec.options.clone();

        async move {
            let transform = transform
                .ok_or_else(|| Error::transform(name.as_str(), format!("no transform registered for kind {}", kind)))?;
            blocking(move || {
                let inputs = resolve_inputs(&base, &patterns, &exclude)?;
                if inputs.is_empty() && !patterns.is_empty() && !allow_empty {
                    return Err(Error::transform(
                        name.as_str(),
                        format!("no input files match {}", patterns.join(", ")),
                    ));
                }
                let ctx = TransformContext {
                    task: name,
                    project_root,
                    inputs,
                    output_dir,
                    options,
                };
                transform.apply(&ctx)
            })
            .await
        }
    }
}
