//! Memory size parsing and formatting.
//!
//! Configuration values like `pool.max_memory` are human-readable sizes
//! ("128M", "1G"). The limit is conveyed to workers, which self-recycle on
//! memory pressure; the server never inspects a child's RSS itself.

use serde::de::{self, Visitor};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get the raw byte count.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Get the size in mebibytes (MiB), truncated.
    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty memory size".to_string());
        }

        let upper = s.to_uppercase();
        let (digits, multiplier) = if let Some(v) = strip_unit(&upper, 'K') {
            (v, 1024u64)
        } else if let Some(v) = strip_unit(&upper, 'M') {
            (v, 1024 * 1024)
        } else if let Some(v) = strip_unit(&upper, 'G') {
            (v, 1024 * 1024 * 1024)
        } else if let Some(v) = strip_unit(&upper, 'T') {
            (v, 1024 * 1024 * 1024 * 1024)
        } else {
            (upper.as_str(), 1)
        };

        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid memory size: '{}'", s))?;
        Ok(Self(value * multiplier))
    }
}

/// Strip a unit suffix ("M", "MB", "MiB") for the given unit letter.
fn strip_unit(s: &str, unit: char) -> Option<&str> {
    for suffix in [format!("{unit}IB"), format!("{unit}B"), format!("{unit}")] {
        if let Some(v) = s.strip_suffix(&suffix) {
            return Some(v);
        }
    }
    None
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;
        const MIB: u64 = 1024 * 1024;
        const KIB: u64 = 1024;
        if self.0 >= GIB && self.0 % GIB == 0 {
            write!(f, "{}G", self.0 / GIB)
        } else if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{}M", self.0 / MIB)
        } else if self.0 >= KIB && self.0 % KIB == 0 {
            write!(f, "{}K", self.0 / KIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct MemorySizeVisitor;

        impl Visitor<'_> for MemorySizeVisitor {
            type Value = MemorySize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a memory size like \"128M\" or a byte count")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(MemorySize::from_bytes(v))
            }
        }

        deserializer.deserialize_any(MemorySizeVisitor)
    }
}
