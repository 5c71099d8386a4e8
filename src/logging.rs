//! Logging infrastructure built on `tracing`.
//!
//! # Environment variables
//!
//! - `MEMBRANE_LOG` - log filter (overrides RUST_LOG)
//! - `MEMBRANE_LOG_LEVEL` - log level: error, warn, info, debug, trace
//! - `MEMBRANE_LOG_FORMAT` - output format: pretty, compact, json
//! - `MEMBRANE_LOG_FILE` - path to a log file (in addition to stderr)
//! - `RUST_LOG` - standard filter (fallback)

use crate::config::LoggingConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO).
    pub level: Level,
    /// Output format (default: Pretty).
    pub format: LogFormat,
    /// Log file path (None = stderr only).
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set).
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the `logging` section of the server configuration.
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        Self {
            level: parse_level(&settings.level).unwrap_or(Level::INFO),
            format: settings.format.parse().unwrap_or_default(),
            file_path: settings.file.clone(),
            filter: None,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence: if a filter is already set, env vars
    /// won't override it.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("MEMBRANE_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("MEMBRANE_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("MEMBRANE_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("MEMBRANE_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level.to_string().to_lowercase())
            })
        } else {
            EnvFilter::new(self.level.to_string().to_lowercase())
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber.
///
/// Should be called once at program startup; subsequent calls are silently
/// ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let appender = config.file_path.as_ref().map(|path| {
        let parent = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("membrane.log");
        RollingFileAppender::new(Rotation::DAILY, parent, file_name)
    });

    let result = match config.format {
        LogFormat::Json => {
            let stderr_layer = fmt::layer().json().with_writer(std::io::stderr);
            let file_layer = appender
                .map(|a| fmt::layer().json().with_ansi(false).with_writer(a).boxed());
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let stderr_layer = fmt::layer().compact().with_writer(std::io::stderr);
            let file_layer = appender
                .map(|a| fmt::layer().compact().with_ansi(false).with_writer(a).boxed());
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer().with_writer(std::io::stderr);
            let file_layer =
                appender.map(|a| fmt::layer().with_ansi(false).with_writer(a).boxed());
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
    };

    // Idempotent: ignore "already initialized".
    let _ = result;
}
