//! Configuration for runtimes and logging.
//!
//! Configuration is plain data deserialized from TOML; every field has a
//! default so partial files are accepted.
//!
//! ```toml
//! [runtime]
//! backend = "cpu"
//! worker_threads = 4
//! initial_streams = 2
//!
//! [logging]
//! level = "debug"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::Backend;
use crate::error::{GridworkError, Result};

/// Environment variable overriding [`LoggingConfig::level`].
pub const LOG_ENV_VAR: &str = "GRIDWORK_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridworkConfig {
    /// Device runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Backend to run on.
    #[serde(default)]
    pub backend: Backend,

    /// Threads used for elementwise operations (0 = one per core).
    #[serde(default)]
    pub worker_threads: usize,

    /// Streams created up front by a stream pool.
    #[serde(default)]
    pub initial_streams: usize,

    /// Prefix for stream worker thread names.
    #[serde(default = "default_stream_name_prefix")]
    pub stream_name_prefix: String,
}

fn default_stream_name_prefix() -> String {
    "gridwork-stream".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            worker_threads: 0,
            initial_streams: 0,
            stream_name_prefix: default_stream_name_prefix(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `gridwork=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include event targets in output.
    #[serde(default)]
    pub with_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: false,
        }
    }
}

impl GridworkConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.stream_name_prefix.is_empty() {
            return Err(GridworkError::InvalidConfig(
                "stream_name_prefix must not be empty".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(GridworkError::InvalidConfig(
                "logging level must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var(LOG_ENV_VAR) {
            if !level.trim().is_empty() {
                self.logging.level = level;
            }
        }
        self
    }

    /// Start building a configuration.
    pub fn builder() -> GridworkConfigBuilder {
        GridworkConfigBuilder::default()
    }
}

/// Builder for [`GridworkConfig`].
#[derive(Debug, Default)]
pub struct GridworkConfigBuilder {
    config: GridworkConfig,
}

impl GridworkConfigBuilder {
    /// Sets the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.config.runtime.backend = backend;
        self
    }

    /// Sets the number of elementwise worker threads.
    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.config.runtime.worker_threads = threads;
        self
    }

    /// Sets the number of streams created up front.
    #[must_use]
    pub fn with_initial_streams(mut self, count: usize) -> Self {
        self.config.runtime.initial_streams = count;
        self
    }

    /// Sets the log filter.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<GridworkConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
