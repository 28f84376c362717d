//! Logging initialization shared by the harness binaries.
//!
//! Test VMs must keep stderr free for the status line, so they log to stdout;
//! the master and slave harnesses log to stderr.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Where human-readable log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub target: LogTarget,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Build from `DTH_LOG`, `DTH_LOG_JSON` and `DTH_LOG_FILE`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("DTH_LOG").unwrap_or_else(|_| default_level.to_string());
        let json = std::env::var("DTH_LOG_JSON")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let file = std::env::var_os("DTH_LOG_FILE").map(PathBuf::from);
        Self {
            level,
            target: LogTarget::Stderr,
            json,
            file,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.target = LogTarget::Stderr;
        self
    }

    #[must_use]
    pub fn with_stdout(mut self) -> Self {
        self.target = LogTarget::Stdout;
        self
    }
}

/// Keeps non-blocking writers flushing until dropped.
#[must_use = "dropping the guards stops background log flushing"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber. Calling it twice is an error from
/// `tracing`, reported back as `Err`.
pub fn init_logging(config: &LogConfig) -> std::io::Result<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let mut guards = Vec::new();

    let (console, console_guard) = match config.target {
        LogTarget::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogTarget::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    };
    guards.push(console_guard);

    let file_writer = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "dth.log".into());
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(writer)
        }
        None => None,
    };

    let console_layer = if config.json {
        fmt::layer().json().with_writer(console).boxed()
    } else {
        fmt::layer().with_target(true).with_writer(console).boxed()
    };
    let file_layer = file_writer.map(|w| fmt::layer().json().with_writer(w).boxed());

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    Ok(LoggingGuards { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = LogConfig {
            level: "info".into(),
            target: LogTarget::Stderr,
            json: false,
            file: None,
        }
        .with_level("debug")
        .with_stdout();
        assert_eq!(config.level, "debug");
        assert_eq!(config.target, LogTarget::Stdout);
    }
}
