//! Leveled file logging.
//!
//! Log levels:
//! - ERROR: Failures that end a run or the dev session
//! - WARN: Recoverable conditions (a watch root that cannot be watched, a failed task)
//! - INFO: High-level notifications (startup, runs, rebuilds, shutdown)
//! - DEBUG: Scheduling decisions and transform invocations
//! - TRACE: Raw watcher events and resolved input sets
//!
//! `--debug` or `KILN_DEBUG=1` selects DEBUG; `KILN_LOG=<level>` selects any
//! level and wins over both. Messages go to `<project>/.kiln/kiln.log`, which
//! is truncated at startup. Console status lines are printed by the CLI.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// Directory below the project root holding kiln's own state.
pub const STATE_DIR: &str = ".kiln";

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Level chosen by the `--debug` flag and the environment.
fn requested_level(debug: bool, kiln_debug: Option<&str>, kiln_log: Option<&str>) -> LogLevel {
    if let Some(level) = kiln_log.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = kiln_debug
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Start logging to `<project>/.kiln/kiln.log`.
///
/// Returns the log path, or `None` when the file cannot be created, in which
/// case logging is a no-op. Only the first call opens a file.
pub fn init(project_dir: &Path, debug: bool) -> Option<PathBuf> {
    let level = requested_level(
        debug,
        std::env::var("KILN_DEBUG").ok().as_deref(),
        std::env::var("KILN_LOG").ok().as_deref(),
    );
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    let dir = project_dir.join(STATE_DIR);
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("kiln.log");
    let file = File::create(&path).ok()?;
    LOG_FILE.set(Mutex::new(file)).ok()?;
    Some(path)
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Whether messages at `level` are written.
pub fn enabled(level: LogLevel) -> bool {
    level <= self::level() && LOG_FILE.get().is_some()
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    let Some(file) = LOG_FILE.get() else {
        return;
    };
    if let Ok(mut file) = file.lock() {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO.
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG; written only with `--debug`, `KILN_DEBUG` or `KILN_LOG`.
#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log at TRACE; written only with `KILN_LOG=trace`.
#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
