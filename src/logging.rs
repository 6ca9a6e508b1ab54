//! Centralized logging configuration for orbot.
//!
//! Structured JSON goes to ~/.orbot/logs/orbot.jsonl (compatible with the
//! `hl` log viewer), human-readable lines go to stderr. The filter sits
//! behind a reload handle so `/debug` can change the level at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::PathsConfig;

/// Log verbosity persisted with the bot settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Error => "error",
        }
    }

    /// Debug switches to Info, everything else to Debug.
    pub fn toggled(self) -> Self {
        match self {
            Self::Debug => Self::Info,
            Self::Info | Self::Error => Self::Debug,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_filter())
    }
}

/// Changes the active log filter after startup.
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogLevelHandle {
    /// A handle not connected to any subscriber, for tests and tools.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    pub fn apply(&self, level: LogLevel) -> Result<()> {
        if let Some(ref handle) = self.inner {
            handle
                .reload(EnvFilter::new(level.as_filter()))
                .context("Failed to reload log filter")?;
        }
        Ok(())
    }
}

/// Initialize logging for the bot process.
///
/// `RUST_LOG` wins over `level` at startup. Returns a guard that must be held
/// for the duration of the program.
pub fn init_logging(paths: &PathsConfig, level: LogLevel) -> Result<(WorkerGuard, LogLevelHandle)> {
    fs::create_dir_all(paths.logs_dir()).context("Failed to create logs directory")?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())
        .context("Failed to open log file")?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let (filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_writer(non_blocking),
        )
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();

    Ok((guard, LogLevelHandle { inner: Some(handle) }))
}

/// Get the size of the current log file in bytes.
pub fn log_size(paths: &PathsConfig) -> Result<u64> {
    let log_file = paths.log_file();
    if log_file.exists() {
        Ok(fs::metadata(&log_file)?.len())
    } else {
        Ok(0)
    }
}

/// Format bytes as human-readable size.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle() {
        assert_eq!(LogLevel::Info.toggled(), LogLevel::Debug);
        assert_eq!(LogLevel::Error.toggled(), LogLevel::Debug);
        assert_eq!(LogLevel::Debug.toggled(), LogLevel::Info);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&LogLevel::Debug).unwrap(), "\"debug\"");
        let level: LogLevel = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(level, LogLevel::Error);
    }

    #[test]
    fn test_detached_handle_is_noop() {
        assert!(LogLevelHandle::detached().apply(LogLevel::Debug).is_ok());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_log_size_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            base_dir: Some(dir.path().to_string_lossy().into_owned()),
        };
        assert_eq!(log_size(&paths).unwrap(), 0);
    }
}
