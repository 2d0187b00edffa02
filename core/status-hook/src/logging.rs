//! File logging for the hook CLI.
//!
//! Hooks run inside the assistant's process tree, so nothing goes to stderr.
//! Records land in a daily-rolling file instead.

use std::env;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_DIR_ENV: &str = "WORKSPACE_STATUS_HOOK_LOG_DIR";
const DEBUG_ENV: &str = "WORKSPACE_STATUS_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "hook.log";

/// Keep the returned guard alive until exit or buffered records are lost.
/// Returns `None` when no log directory is usable; the CLI still works.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn log_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os(LOG_DIR_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join("workspace-status").join("logs"))
}
