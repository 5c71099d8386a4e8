//! YAML configuration loading and validation.
//!
//! Missing keys fall back to defaults, so a minimal config only needs the
//! worker script path:
//!
//! ```yaml
//! php:
//!   worker: app/worker.php
//! pool:
//!   min_workers: 4
//!   max_workers: 16
//! ```

use crate::error::{MembraneError, Result};
use crate::memory::MemorySize;
use serde::de::{self, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Complete server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub php: PhpConfig,
    pub pool: PoolConfig,
    pub websocket: WebSocketConfig,
    pub watch: WatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address; a bare `:port` binds all interfaces.
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhpConfig {
    /// Interpreter command used to start workers.
    pub binary: String,
    /// Path to the worker script, passed as the single argument.
    pub worker: String,
    /// INI settings handed to workers as `PHP_INI_<key>` environment entries.
    pub ini: HashMap<String, String>,
}

impl Default for PhpConfig {
    fn default() -> Self {
        Self {
            binary: "php".to_string(),
            worker: String::new(),
            ini: HashMap::from([
                ("memory_limit".to_string(), "256M".to_string()),
                ("max_execution_time".to_string(), "30".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Requests served before a worker is recycled; 0 disables count-based
    /// recycling.
    pub max_jobs: u64,
    /// Per-worker memory budget, enforced by the worker itself.
    pub max_memory: MemorySize,
    pub idle_timeout: Duration,
    pub allocate_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 32,
            max_jobs: 10_000,
            max_memory: MemorySize::from_mib(128),
            idle_timeout: Duration::from_secs(60),
            allocate_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub path: String,
    /// Worker script handling stream events.
    pub worker: String,
    /// 0 means unlimited.
    pub max_connections: usize,
    pub ping_interval: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/ws".to_string(),
            worker: String::new(),
            max_connections: 10_000,
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub dirs: Vec<PathBuf>,
    pub interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dirs: Vec::new(),
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug, trace.
    pub level: String,
    /// pretty, compact, json.
    pub format: String,
    /// Log file path in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Read configuration from a YAML file, applying defaults for missing
    /// values, and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| MembraneError::Config(format!("reading {}: {}", path.display(), e)))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .map_err(|e| MembraneError::Config(format!("parsing {}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.pool.min_workers < 1 {
            return Err(MembraneError::Config(format!(
                "pool.min_workers must be >= 1, got {}",
                self.pool.min_workers
            )));
        }
        if self.pool.max_workers < self.pool.min_workers {
            return Err(MembraneError::Config(format!(
                "pool.max_workers ({}) must be >= pool.min_workers ({})",
                self.pool.max_workers, self.pool.min_workers
            )));
        }
        if self.php.worker.is_empty() {
            return Err(MembraneError::Config(
                "php.worker is required when a worker pool is configured".to_string(),
            ));
        }
        if self.server.address.is_empty() {
            return Err(MembraneError::Config(
                "server.address is required".to_string(),
            ));
        }
        if self.websocket.enabled && self.websocket.worker.is_empty() {
            return Err(MembraneError::Config(
                "websocket.worker is required when websocket is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Listen address with a bare `:port` normalized to all interfaces.
    pub fn listen_address(&self) -> String {
        if self.server.address.starts_with(':') {
            format!("0.0.0.0{}", self.server.address)
        } else {
            self.server.address.clone()
        }
    }
}

/// A span of time parsed from strings like "500ms", "5s", "2m" or "1h".
/// Bare numbers are seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const ZERO: Self = Self(std::time::Duration::ZERO);

    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(std::time::Duration::from_millis(millis))
    }

    /// The underlying `std::time::Duration`.
    pub const fn get(&self) -> std::time::Duration {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl Default for Duration {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FromStr for Duration {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1.0)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000.0)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000.0)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000.0)
        } else {
            (s, 1_000.0)
        };
        let value: f64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: '{}'", s))?;
        if value < 0.0 {
            return Err(format!("duration must not be negative: '{}'", s));
        }
        Ok(Self(std::time::Duration::from_secs_f64(
            value * unit_ms / 1_000.0,
        )))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration like \"5s\" or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
                if v < 0.0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(Duration(std::time::Duration::from_secs_f64(v)))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
