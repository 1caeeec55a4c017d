//! Tracing setup for the tracker
//!
//! The console gets human-readable output (or JSON when piped into other
//! tooling). A run can last hours, so the optional log file is written
//! through a non-blocking daily-rolling appender: a slow disk must never
//! stall sample processing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable that overrides the configured filter
pub const LOG_ENV: &str = "RUNCOACH_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Daily-rolling JSON log next to this path; console only when unset
    pub file: Option<PathBuf>,
    /// Keep per-fix position filter events when running verbose
    pub trace_filter: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            file: None,
            trace_filter: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive for this configuration
    ///
    /// Position filter events arrive once per fix, so that module stays at
    /// `info` unless asked for.
    pub fn directive(&self) -> String {
        let mut directive = format!("runcoach={}", self.level);
        if !self.trace_filter && self.level > LogLevel::Info {
            directive.push_str(",runcoach::filter=info");
        }
        directive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a `-v` count from the CLI onto a level
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and closes the log file.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(config.directive()));

    let console = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (directory, name) = split_log_path(path);
            fs::create_dir_all(&directory)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, name));
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(directive = %config.directive(), file = ?config.file, "Logging ready");
    Ok(guard)
}

fn split_log_path(path: &Path) -> (PathBuf, String) {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("runcoach.log")
        .to_string();
    (directory, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(9), LogLevel::Trace);
    }

    #[test]
    fn test_filter_module_stays_quiet_when_verbose() {
        let mut config = LogConfig {
            level: LogLevel::Debug,
            ..Default::default()
        };
        assert_eq!(config.directive(), "runcoach=debug,runcoach::filter=info");

        config.trace_filter = true;
        assert_eq!(config.directive(), "runcoach=debug");

        config.level = LogLevel::Warn;
        config.trace_filter = false;
        assert_eq!(config.directive(), "runcoach=warn");
    }

    #[test]
    fn test_log_path_split() {
        let (dir, name) = split_log_path(Path::new("/var/log/runcoach/track.log"));
        assert_eq!(dir, PathBuf::from("/var/log/runcoach"));
        assert_eq!(name, "track.log");

        let (dir, name) = split_log_path(Path::new("track.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "track.log");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: LogConfig = toml::from_str("level = \"debug\"").unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }
}
