//! Watch coordinator: file changes to task re-runs.
//!
//! Each binding maps a project-relative glob to the tasks it re-runs. A batch
//! of debounced filesystem events is resolved to the union of the bound tasks
//! and executed as one `Exact` run, so unrelated tasks are never re-invoked.

use globset::GlobMatcher;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::core::dag::TaskGraph;
use crate::core::request::RunRequest;
use crate::core::task::TaskName;
use crate::error::{ConfigError, Error, Result};
use crate::inputs::{compile, static_prefix};
use crate::orchestration::scheduler::{RunResult, Scheduler};
use crate::{klog, klog_debug, klog_error, klog_warn};

/// Consecutive failed event batches after which watching is given up.
const MAX_FAILED_BATCHES: usize = 5;

/// A glob over project-relative paths and the tasks it re-runs.
#[derive(Debug, Clone)]
pub struct WatchBinding {
    pub pattern: String,
    matcher: GlobMatcher,
    pub tasks: Vec<TaskName>,
}

impl WatchBinding {
    pub fn matches(&self, relative: &Path) -> bool {
        self.matcher.is_match(relative)
    }

    /// Directory to watch for this binding, relative to the project root.
    pub fn root(&self) -> PathBuf {
        static_prefix(&self.pattern)
    }
}

pub struct WatchCoordinator {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    bindings: Vec<WatchBinding>,
    ignored: Vec<PathBuf>,
    debounce: Duration,
}

impl WatchCoordinator {
    pub fn new(root: &Path, debounce: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            canonical_root: root.canonicalize().ok(),
            bindings: Vec::new(),
            ignored: Vec::new(),
            debounce,
        }
    }

    /// Coordinator for the `[[watch.bind]]` entries of `config`.
    ///
    /// Events inside the output directory never trigger runs.
    pub fn from_config(config: &PipelineConfig, graph: &TaskGraph) -> std::result::Result<Self, ConfigError> {
        let paths = graph.paths();
        let mut coordinator = Self::new(&paths.root, Duration::from_millis(config.watch.debounce_ms));
        coordinator.ignore(&paths.output);
        coordinator.ignore(&paths.root.join(crate::log::STATE_DIR));
        for binding in &config.watch.bind {
            coordinator.bind(&binding.pattern, binding.tasks.iter().map(String::as_str), graph)?;
        }
        Ok(coordinator)
    }

    /// Bind `pattern` to `tasks`; every task must exist in `graph`.
    pub fn bind<'a, I>(&mut self, pattern: &str, tasks: I, graph: &TaskGraph) -> std::result::Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let matcher = compile(pattern)?;
        let tasks = tasks
            .into_iter()
            .map(|name| {
                let name = TaskName::from(name);
                if graph.contains_task(&name) {
                    Ok(name)
                } else {
                    Err(ConfigError::UnknownTask(name.0))
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        klog_debug!("Watch binding {} -> {:?}", pattern, tasks);
        self.bindings.push(WatchBinding {
            pattern: pattern.to_string(),
            matcher,
            tasks,
        });
        Ok(())
    }

    /// Never trigger runs for paths under `dir`.
    pub fn ignore(&mut self, dir: &Path) {
        self.ignored.push(dir.to_path_buf());
    }

    pub fn bindings(&self) -> &[WatchBinding] {
        &self.bindings
    }

    fn relative<'p>(&self, path: &'p Path) -> Option<&'p Path> {
        if path.is_relative() {
            return Some(path);
        }
        path.strip_prefix(&self.root)
            .ok()
            .or_else(|| {
                self.canonical_root
                    .as_ref()
                    .and_then(|root| path.strip_prefix(root).ok())
            })
    }

    fn is_ignored(&self, relative: &Path) -> bool {
        let absolute = self.root.join(relative);
        self.ignored.iter().any(|dir| absolute.starts_with(dir))
    }

    /// Whether `path` lies in the project and outside every ignored directory.
    fn is_watched(&self, path: &Path) -> bool {
        self.relative(path)
            .map(|relative| !self.is_ignored(relative))
            .unwrap_or(false)
    }

    /// Tasks bound to a changed path (absolute or project-relative).
    pub fn tasks_for(&self, path: &Path) -> BTreeSet<TaskName> {
        let Some(relative) = self.relative(path) else {
            return BTreeSet::new();
        };
        if self.is_ignored(relative) {
            return BTreeSet::new();
        }
        self.bindings
            .iter()
            .filter(|b| b.matches(relative))
            .flat_map(|b| b.tasks.iter().cloned())
            .collect()
    }

    /// Run request for a single changed path, if any binding matches.
    pub fn on_file_event(&self, path: &Path) -> Option<RunRequest> {
        self.request_for([path])
    }

    /// One coalesced run request for a batch of changed paths.
    pub fn request_for<I, P>(&self, paths: I) -> Option<RunRequest>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let tasks: BTreeSet<TaskName> = paths
            .into_iter()
            .flat_map(|p| self.tasks_for(p.as_ref()))
            .collect();
        if tasks.is_empty() {
            None
        } else {
            Some(RunRequest::exact(tasks))
        }
    }

    /// Absolute directories to watch recursively; nested roots are folded
    /// into their ancestors.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let all: BTreeSet<PathBuf> = self
            .bindings
            .iter()
            .map(|b| self.root.join(b.root()))
            .collect();
        all.iter()
            .filter(|dir| !all.iter().any(|other| other != *dir && dir.starts_with(other)))
            .cloned()
            .collect()
    }

    /// Watch until `cancel` fires, running each batch of changes through
    /// `scheduler` and handing results to `on_result`.
    ///
    /// A run in flight when `cancel` fires is allowed to finish.
    ///
    /// # Errors
    /// Fails when the watcher cannot be created, no root can be watched, the
    /// watcher stops delivering events, or it reports errors for
    /// `MAX_FAILED_BATCHES` batches in a row.
    pub async fn run<F>(self, scheduler: Arc<Scheduler>, cancel: CancellationToken, mut on_result: F) -> Result<()>
    where
        F: FnMut(&RunResult) + Send,
    {
        let (tx, rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(self.debounce, move |res: DebounceEventResult| {
            let _ = tx.send(res);
        })?;

        let mut watched = 0;
        for dir in self.watch_roots() {
            match debouncer.watcher().watch(&dir, RecursiveMode::Recursive) {
                Ok(()) => {
                    klog_debug!("Watching {}", dir.display());
                    watched += 1;
                }
                Err(e) => klog_warn!("Cannot watch {}: {}", dir.display(), e),
            }
        }
        if watched == 0 {
            return Err(Error::Watch("no watch root could be watched".to_string()));
        }
        klog!("Watch started: {} roots, {} bindings", watched, self.bindings.len());

        let result = self.drive(rx, &scheduler, &cancel, &mut on_result).await;
        drop(debouncer);
        klog!("Watch stopped");
        result
    }

    /// Event loop behind [`run`](Self::run), fed by the debouncer's channel.
    async fn drive<F>(
        &self,
        mut rx: mpsc::UnboundedReceiver<DebounceEventResult>,
        scheduler: &Scheduler,
        cancel: &CancellationToken,
        on_result: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&RunResult) + Send,
    {
        let mut failed_batches = 0;
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None if cancel.is_cancelled() => return Ok(()),
                    None => return Err(Error::Watch("file watcher stopped unexpectedly".to_string())),
                },
            };

            let mut changed: BTreeSet<PathBuf> = BTreeSet::new();
            let mut pending = Some(first);
            while let Some(batch) = pending.take() {
                match batch {
                    Ok(events) => {
                        failed_batches = 0;
                        changed.extend(
                            events
                                .into_iter()
                                .filter(|e| {
                                    matches!(e.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous)
                                })
                                .map(|e| e.path)
                                .filter(|path| self.is_watched(path)),
                        );
                    }
                    Err(e) => {
                        failed_batches += 1;
                        klog_warn!("Watch error ({} in a row): {}", failed_batches, e);
                        if failed_batches >= MAX_FAILED_BATCHES {
                            return Err(Error::Watch(format!(
                                "watcher failed {} times in a row, last error: {}",
                                failed_batches, e
                            )));
                        }
                    }
                }
                pending = rx.try_recv().ok();
            }

            // Paths under ignored directories (kiln's own log among them) are
            // dropped silently: logging them would produce further events.
            if changed.is_empty() {
                continue;
            }
            let Some(request) = self.request_for(&changed) else {
                klog_debug!("Ignoring {} unbound changes", changed.len());
                continue;
            };
            klog!("Changes in {} files, running {}", changed.len(), request);
            match scheduler.run(&request).await {
                Ok(result) => on_result(&result),
                Err(e) => klog_error!("Watch run failed: {}", e),
            }
        }
    }
}
