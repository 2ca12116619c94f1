//! Orchestration layer: running the task graph.
//!
//! The scheduler executes run requests, the watch coordinator turns file
//! changes into narrow runs, and the dev server pushes reloads to browsers.

pub mod dev;
pub mod scheduler;
pub mod server;
pub mod watch;

pub use dev::{cancel_on_ctrl_c, spawn_status_printer, status_line, DevSession};
pub use scheduler::{RunResult, Scheduler, SchedulerEvent};
pub use server::{DevServer, Reloader, RELOAD_PATH};
pub use watch::{WatchBinding, WatchCoordinator};
