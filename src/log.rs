//! Run log for the scheduler, written to `~/.stacksched/stacksched.log`.
//!
//! - ERROR: a job failed terminally or a teardown could not complete
//! - WARN: attempt failures, skipped jobs, schedule warnings
//! - INFO: run lifecycle (dispatch, terminal states, run summary)
//! - DEBUG: attempts, parallel members, state transitions
//!
//! DEBUG lines are written only with `--debug` or `STACKSCHED_DEBUG=1`.
//! Until [`init_with_debug`] runs, every call is a no-op, so library users
//! and tests never touch the filesystem.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

const DEBUG_ENV: &str = "STACKSCHED_DEBUG";

static LOG_FILE: OnceLock<PathBuf> = OnceLock::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn max() -> Self {
        match MAX_LEVEL.load(Ordering::Relaxed) {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Start logging for this process. The log file is truncated.
pub fn init_with_debug(debug: bool) {
    let level = if debug || debug_from_env() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    MAX_LEVEL.store(level as u8, Ordering::SeqCst);

    let Some(dir) = dirs::home_dir().map(|h| h.join(".stacksched")) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join("stacksched.log");
    if std::fs::write(&path, "").is_ok() {
        LOG_FILE.set(path).ok();
    }
}

/// Append one line at `level`.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > LogLevel::max() {
        return;
    }
    let Some(path) = LOG_FILE.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().append(true).open(path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.label(), msg);
    }
}

#[macro_export]
macro_rules! slog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Only written in debug mode.
#[macro_export]
macro_rules! slog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}
