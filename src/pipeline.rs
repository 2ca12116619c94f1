//! Loading a project: configuration, transform registry and task graph.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::{PipelineConfig, DEFAULT_CONFIG_FILE};
use crate::core::dag::TaskGraph;
use crate::orchestration::scheduler::Scheduler;
use crate::transform::TransformRegistry;
use crate::util::remove_dir_if_exists;
use crate::{klog, Error, Result};

/// A loaded project, ready to run.
#[derive(Debug)]
pub struct Pipeline {
    pub config: PipelineConfig,
    pub graph: Arc<TaskGraph>,
    pub registry: Arc<TransformRegistry>,
}

impl Pipeline {
    /// Load `config_path` (default `<root>/kiln.toml`) and build the graph
    /// with the built-in transforms.
    pub fn load(root: &Path, config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.join(DEFAULT_CONFIG_FILE));
        let config = PipelineConfig::load(&config_path)?;
        Self::from_config(config, root, TransformRegistry::with_builtins())
    }

    pub fn from_config(config: PipelineConfig, root: &Path, registry: TransformRegistry) -> Result<Self> {
        let graph = TaskGraph::build(config.tasks.clone(), config.project_paths(root), &registry)?;
        Ok(Self {
            config,
            graph: Arc::new(graph),
            registry: Arc::new(registry),
        })
    }

    /// Scheduler over this pipeline's graph.
    pub fn scheduler(&self, jobs: usize) -> Scheduler {
        Scheduler::new(self.graph.clone(), self.registry.clone()).with_jobs(jobs)
    }

    pub fn output_dir(&self) -> &Path {
        &self.graph.paths().output
    }

    /// Remove the output directory. Succeeds when it is already absent.
    pub fn clean(&self) -> Result<bool> {
        clean_output(self.graph.paths().root.as_path(), self.output_dir())
    }
}

/// Remove `output`, refusing to delete the project root or anything above it.
pub fn clean_output(root: &Path, output: &Path) -> Result<bool> {
    let root = normalize(root);
    let output = normalize(output);
    if root.starts_with(&output) {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to clean {}: it contains the project", output.display()),
        )));
    }
    let removed = remove_dir_if_exists(&output)?;
    klog!(
        "Clean {}: {}",
        output.display(),
        if removed { "removed" } else { "already absent" }
    );
    Ok(removed)
}

/// Resolve `.` and `..` components lexically.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
