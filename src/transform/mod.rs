//! Transform registry.
//!
//! A transform is the opaque "apply T to these files" step a task wraps.
//! The registry maps the `kind` of a task declaration to an implementation.
//! Built-in kinds are glue only: copying, concatenation, delegating to an
//! external program, and deriving the font stylesheet fragment.

pub mod command;
pub mod concat;
pub mod copy;
pub mod font_manifest;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::task::TaskName;
use crate::inputs::InputFile;
use crate::Result;

pub use command::CommandTransform;
pub use concat::ConcatTransform;
pub use copy::CopyTransform;
pub use font_manifest::FontManifestTransform;

/// Everything a transform may touch for one invocation.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub task: TaskName,
    pub project_root: PathBuf,
    pub inputs: Vec<InputFile>,
    pub output_dir: PathBuf,
    pub options: toml::Table,
}

impl TransformContext {
    pub fn string_option(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn bool_option(&self, key: &str, default: bool) -> bool {
        self.options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    pub fn string_list_option(&self, key: &str) -> Option<Vec<String>> {
        string_list(&self.options, key)
    }
}

pub(crate) fn string_list(options: &toml::Table, key: &str) -> Option<Vec<String>> {
    options.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect()
    })
}

/// A file-to-file conversion step.
///
/// Implementations run on the blocking pool and must write outputs
/// atomically: a failed invocation leaves no partially written file.
pub trait Transform: Send + Sync {
    /// Kind name used in task declarations.
    fn kind(&self) -> &'static str;

    /// Reject option tables the transform cannot run with.
    fn validate(&self, _options: &toml::Table) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Run the transform, returning the files it produced.
    fn apply(&self, ctx: &TransformContext) -> Result<Vec<PathBuf>>;
}

/// Mapping from transform kind to implementation.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: BTreeMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CopyTransform));
        registry.register(Arc::new(ConcatTransform));
        registry.register(Arc::new(CommandTransform));
        registry.register(Arc::new(FontManifestTransform::new()));
        registry
    }

    /// Register `transform` under its kind, replacing any previous one.
    pub fn register(&mut self, transform: Arc<dyn Transform>) {
        self.transforms
            .insert(transform.kind().to_string(), transform);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.transforms.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.transforms.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
