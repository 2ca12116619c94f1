use thiserror::Error;

/// Invalid pipeline configuration.
///
/// Always raised before any transform runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Task name must not be empty")]
    EmptyName,

    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {missing}")]
    MissingPredecessor { task: String, missing: String },

    #[error("Dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Task {task} uses unknown transform {kind}")]
    UnknownTransform { task: String, kind: String },

    #[error("Task {task} has invalid options: {reason}")]
    InvalidOptions { task: String, reason: String },

    #[error("Tasks {first} and {second} write overlapping outputs ({target})")]
    OutputOverlap {
        first: String,
        second: String,
        target: String,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Invalid glob pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transform error in {task}: {message}")]
    Transform { task: String, message: String },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Shorthand for a transform failure attributed to `task`.
    pub fn transform(task: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transform {
            task: task.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
