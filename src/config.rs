//! Buffering configuration
//!
//! Everything the buffering layer reads from configuration: whether files
//! are buffered at all, the staging buffer size, which adapter drives it,
//! how vectored reads are grouped, and two wait thresholds. Loadable from
//! YAML; every field has a default.
//!
//! ```yaml
//! enabled: true
//! buffer_size: 16777216
//! adapter: async
//! readv:
//!   policy: fixed_count
//!   max_extents: 10
//! aio_wait_warn_ms: 5000
//! close_wait_ms: 30000
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default staging buffer size (16 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default extent count per vectored-read group
pub const DEFAULT_MAX_EXTENTS: usize = 10;

/// Default upper bound on a density group's span (16 MiB)
pub const DEFAULT_MAX_SPAN: u64 = 16 * 1024 * 1024;

/// Default minimum fill ratio of a density group
pub const DEFAULT_MIN_DENSITY: f64 = 0.6;

// =============================================================================
// Adapter selection
// =============================================================================

/// Which I/O adapter drives the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Blocking pread/pwrite on the calling thread
    Sync,
    /// Submission plus completion callback
    #[default]
    Async,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Sync => write!(f, "sync"),
            AdapterKind::Async => write!(f, "async"),
        }
    }
}

impl FromStr for AdapterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(AdapterKind::Sync),
            "async" | "aio" => Ok(AdapterKind::Async),
            other => Err(Error::Config(format!("unknown adapter: {other}"))),
        }
    }
}

// =============================================================================
// Vectored-read grouping
// =============================================================================

/// How a vectored read is split into batched transport reads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Groups of at most `max_extents` extents, in order
    FixedCount {
        #[serde(default = "default_max_extents")]
        max_extents: usize,
    },
    /// Grow a group while it stays small, or stays bounded and dense
    Density {
        #[serde(default)]
        min_span: u64,
        #[serde(default = "default_max_span")]
        max_span: u64,
        #[serde(default = "default_min_density")]
        min_density: f64,
    },
}

fn default_max_extents() -> usize {
    DEFAULT_MAX_EXTENTS
}

fn default_max_span() -> u64 {
    DEFAULT_MAX_SPAN
}

fn default_min_density() -> f64 {
    DEFAULT_MIN_DENSITY
}

impl Default for CoalescePolicy {
    fn default() -> Self {
        CoalescePolicy::FixedCount {
            max_extents: DEFAULT_MAX_EXTENTS,
        }
    }
}

impl CoalescePolicy {
    /// Density policy with the default thresholds.
    pub fn density() -> Self {
        CoalescePolicy::Density {
            min_span: 0,
            max_span: DEFAULT_MAX_SPAN,
            min_density: DEFAULT_MIN_DENSITY,
        }
    }

    /// Validate the thresholds.
    pub fn validate(&self) -> Result<()> {
        match *self {
            // max_extents == 0 is accepted and behaves as 1
            CoalescePolicy::FixedCount { .. } => Ok(()),
            CoalescePolicy::Density {
                min_span,
                max_span,
                min_density,
            } => {
                if max_span == 0 {
                    return Err(Error::Config("readv max_span must be > 0".into()));
                }
                if min_span > max_span {
                    return Err(Error::Config(format!(
                        "readv min_span {min_span} exceeds max_span {max_span}"
                    )));
                }
                if !(0.0..=1.0).contains(&min_density) {
                    return Err(Error::Config(format!(
                        "readv min_density {min_density} outside [0, 1]"
                    )));
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Buffer configuration
// =============================================================================

/// Configuration of the buffering layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Wrap files in a buffering layer
    pub enabled: bool,

    /// Staging buffer size in bytes
    pub buffer_size: usize,

    /// Adapter driving the buffer
    pub adapter: AdapterKind,

    /// Vectored-read grouping
    pub readv: CoalescePolicy,

    /// Warn each time a blocking AIO wait exceeds this many milliseconds
    pub aio_wait_warn_ms: u64,

    /// How long close waits for outstanding AIO, in milliseconds
    pub close_wait_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            adapter: AdapterKind::default(),
            readv: CoalescePolicy::default(),
            aio_wait_warn_ms: 5_000,
            close_wait_ms: 30_000,
        }
    }
}

impl BufferConfig {
    /// Parse from YAML and validate.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file and validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidArgument("buffer_size must be > 0".into()));
        }
        if self.aio_wait_warn_ms == 0 {
            return Err(Error::Config("aio_wait_warn_ms must be > 0".into()));
        }
        self.readv.validate()
    }

    pub fn aio_wait_warn(&self) -> Duration {
        Duration::from_millis(self.aio_wait_warn_ms)
    }

    pub fn close_wait(&self) -> Duration {
        Duration::from_millis(self.close_wait_ms)
    }
}
