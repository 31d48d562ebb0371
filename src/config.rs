//! Configuration
//!
//! Settings are read from a `replayflow.toml` file. Every section and field
//! is optional:
//!
//! ```toml
//! [transform]
//! fail_mode = "open"                  # or "closed"
//! conservative_virtual_calls = true
//! header_cache_size = 1024
//!
//! [vm]
//! max_call_depth = 1024
//! max_value_stack = 65536
//! trace = false
//!
//! [batch]
//! threads = 0                         # 0 = one per CPU
//! extension = "flow"
//!
//! [log]
//! level = "info"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::backend::hierarchy::DEFAULT_HEADER_CACHE;
use crate::backend::loader::UNIT_EXTENSION;
use crate::backend::vm::VmConfig;

/// Name of the configuration file looked up by the CLI
pub const CONFIG_FILE: &str = "replayflow.toml";

/// Top-level configuration (`replayflow.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    pub transform: TransformConfig,
    pub vm: VmConfig,
    pub batch: BatchConfig,
    pub log: LogConfig,
}

/// What happens when a unit cannot be transformed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Keep the unchanged bytes and log a warning
    #[default]
    Open,
    /// Report the failure to the caller
    Closed,
}

/// The `[transform]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub fail_mode: FailMode,
    /// Treat a virtual call as continuable unless its static owner is
    /// sealed, since any subtype may override the method as continuable
    pub conservative_virtual_calls: bool,
    /// Capacity of the decoded-header cache per resolver
    pub header_cache_size: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Open,
            conservative_virtual_calls: true,
            header_cache_size: DEFAULT_HEADER_CACHE,
        }
    }
}

impl TransformConfig {
    pub fn fail_closed() -> Self {
        Self {
            fail_mode: FailMode::Closed,
            ..Self::default()
        }
    }
}

/// The `[batch]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker threads; 0 uses one per CPU
    pub threads: usize,
    /// Extension of compiled unit files
    pub extension: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            extension: UNIT_EXTENSION.to_string(),
        }
    }
}

impl BatchConfig {
    /// Worker threads after applying the CPU default
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

/// The `[log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl LogConfig {
    pub fn level(&self) -> Result<tracing::Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                field: "log.level",
                value: self.level.clone(),
            })
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: Option<PathBuf>, source: toml::de::Error },
    InvalidValue { field: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "Cannot read {}: {}", path.display(), source),
            Self::Parse { path: Some(path), source } => write!(f, "Invalid {}: {}", path.display(), source),
            Self::Parse { path: None, source } => write!(f, "Invalid configuration: {}", source),
            Self::InvalidValue { field, value } => write!(f, "Invalid value '{}' for {}", value, field),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::InvalidValue { .. } => None,
        }
    }
}

impl FlowConfig {
    /// Parse configuration from TOML content.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.log.level()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })
    }

    /// Load `replayflow.toml` from `dir` if it exists, defaults otherwise
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}
