//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary project trees
//! - A recording transform with configurable delay and failure
//! - Predefined task sets

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;

use kiln::config::{PipelineConfig, WatchBindingSpec};
use kiln::core::TaskSpec;
use kiln::orchestration::{Scheduler, SchedulerEvent};
use kiln::transform::{Transform, TransformContext, TransformRegistry};
use kiln::{Error, Pipeline, Result};

/// A scratch project directory.
pub struct TestProject {
    /// Keeps the directory alive for the duration of the test.
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp directory");
        Self { temp_dir, path }
    }

    /// Write a project-relative file, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).expect("Failed to create parent");
        std::fs::write(&path, contents).expect("Failed to write file");
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path.join(relative)).expect("Failed to read file")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path.join(relative).exists()
    }

    /// Every file below `relative`, as paths relative to it.
    pub fn files_under(&self, relative: &str) -> BTreeSet<PathBuf> {
        let base = self.path.join(relative);
        let mut files = BTreeSet::new();
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.insert(path.strip_prefix(&base).unwrap().to_path_buf());
                }
            }
        }
        files
    }
}

/// One call into the recording transform.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Transform of kind `record`: logs each invocation, then sleeps for
/// `sleep_ms` and fails when `fail = true`. Writes `<task>.out` on success.
#[derive(Default)]
pub struct Recorder {
    invocations: Mutex<Vec<Invocation>>,
}

impl Recorder {
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Task names in start order.
    pub fn started(&self) -> Vec<String> {
        let mut calls = self.invocations();
        calls.sort_by_key(|c| c.started);
        calls.into_iter().map(|c| c.task).collect()
    }

    pub fn count(&self, task: &str) -> usize {
        self.invocations().iter().filter(|c| c.task == task).count()
    }

    pub fn get(&self, task: &str) -> Invocation {
        self.invocations()
            .into_iter()
            .find(|c| c.task == task)
            .unwrap_or_else(|| panic!("{} was never invoked", task))
    }
}

impl Transform for Recorder {
    fn kind(&self) -> &'static str {
        "record"
    }

    fn apply(&self, ctx: &TransformContext) -> Result<Vec<PathBuf>> {
        let started = Instant::now();
        if let Some(ms) = ctx.options.get("sleep_ms").and_then(|v| v.as_integer()) {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
        let fail = ctx.bool_option("fail", false);
        self.invocations.lock().unwrap().push(Invocation {
            task: ctx.task.to_string(),
            started,
            finished: Instant::now(),
        });
        if fail {
            return Err(Error::transform(ctx.task.as_str(), "exit status 1"));
        }
        let out = ctx.output_dir.join(format!("{}.out", ctx.task));
        kiln::util::write_atomic(&out, ctx.task.as_str().as_bytes())?;
        Ok(vec![out])
    }
}

/// A `record` task writing into its own output directory.
pub fn record(name: &str) -> TaskSpec {
    TaskSpec::new(name, "record").output(name, None)
}

/// `compile -> bundle -> minifyBundle`
pub fn chain_specs() -> Vec<TaskSpec> {
    vec![
        record("compile"),
        record("bundle").after(["compile"]),
        record("minifyBundle").reads_output_of("bundle"),
    ]
}

/// `n` tasks without dependencies, each sleeping `sleep_ms`.
pub fn independent_specs(n: usize, sleep_ms: i64) -> Vec<TaskSpec> {
    (0..n)
        .map(|i| record(&format!("task-{}", i)).option("sleep_ms", sleep_ms))
        .collect()
}

/// Pipeline configuration with the given tasks and watch bindings.
pub fn config(tasks: Vec<TaskSpec>, bindings: &[(&str, &[&str])]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.tasks = tasks;
    config.watch.debounce_ms = 50;
    config.watch.bind = bindings
        .iter()
        .map(|(pattern, tasks)| WatchBindingSpec::new(pattern, tasks))
        .collect();
    config
}

/// A pipeline with the built-in transforms plus a [`Recorder`], a scheduler
/// and its event stream.
pub struct SchedulerHarness {
    pub project: TestProject,
    pub pipeline: Pipeline,
    pub recorder: Arc<Recorder>,
    pub scheduler: Arc<Scheduler>,
    pub event_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl SchedulerHarness {
    pub fn new(tasks: Vec<TaskSpec>, jobs: usize) -> Self {
        Self::with_project(TestProject::new(), config(tasks, &[]), jobs)
    }

    pub fn with_project(project: TestProject, config: PipelineConfig, jobs: usize) -> Self {
        let recorder = Arc::new(Recorder::default());
        let mut registry = TransformRegistry::with_builtins();
        registry.register(recorder.clone());
        let pipeline =
            Pipeline::from_config(config, &project.path, registry).expect("Failed to build pipeline");
        let (tx, event_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(pipeline.scheduler(jobs).with_events(tx));
        Self {
            project,
            pipeline,
            recorder,
            scheduler,
            event_rx,
        }
    }

    /// Events received so far.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn root(&self) -> &Path {
        &self.project.path
    }
}
