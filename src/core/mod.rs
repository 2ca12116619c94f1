//! Core domain models for the build pipeline.
//!
//! Tasks, run requests and the validated task graph they live in.

pub mod dag;
pub mod request;
pub mod task;

pub use dag::TaskGraph;
pub use request::{RunRequest, RunScope};
pub use task::{DependencyType, OutputRoot, Task, TaskName, TaskOutcome, TaskReport, TaskSpec};
