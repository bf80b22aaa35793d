//! Shared logging utilities for bulk import binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "bulkimport=info";
const HOME_ENV: &str = "BULKIMPORT_HOME";

/// Logging configuration shared by bulk import binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror debug output to stderr regardless of `RUST_LOG`.
    pub verbose: bool,
    /// Keep stderr quiet (warnings only); used when stdout carries JSON.
    pub quiet: bool,
    /// Write a daily-rolling log file under [`logs_dir`].
    pub log_to_file: bool,
}

impl<'a> LogConfig<'a> {
    pub fn new(app_name: &'a str) -> Self {
        Self {
            app_name,
            verbose: false,
            quiet: false,
            log_to_file: true,
        }
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initialize tracing with an optional daily file writer and stderr output.
///
/// The returned guard flushes the non-blocking file writer on drop, so callers
/// must hold it for the lifetime of the process.
pub fn init_logging(config: LogConfig<'_>) -> Result<Option<WorkerGuard>> {
    let mut guard = None;
    let file_layer = if config.log_to_file {
        let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
        let file_name = format!("{}.log", sanitize_name(config.app_name));
        let appender = tracing_appender::rolling::daily(log_dir, file_name);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(default_filter()),
        )
    } else {
        None
    };

    let console_filter = if config.verbose {
        EnvFilter::new("bulkimport=debug")
    } else if config.quiet {
        EnvFilter::new("warn")
    } else {
        default_filter()
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Home directory for bulk import state: `$BULKIMPORT_HOME` or `~/.bulkimport`.
pub fn bulkimport_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    dirs::home_dir()
        .map(|home| home.join(".bulkimport"))
        .context("Could not determine home directory")
}

/// Logs directory: `<home>/logs`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(bulkimport_home()?.join("logs"))
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir()?;
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("bulk import/cli"), "bulk_import_cli");
        assert_eq!(sanitize_name("bulkimport-01"), "bulkimport-01");
    }

    #[test]
    fn test_home_override_and_logs_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        std::env::set_var(HOME_ENV, temp.path());

        assert_eq!(bulkimport_home().unwrap(), temp.path());
        let logs = ensure_logs_dir().unwrap();
        assert_eq!(logs, temp.path().join("logs"));
        assert!(logs.is_dir());

        std::env::remove_var(HOME_ENV);
    }
}
