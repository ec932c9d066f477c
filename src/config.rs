//! Control-plane configuration.
//!
//! Configuration is read from a TOML file; every field has a default so a
//! missing file or a partial file is valid.

use crate::error::{Error, Result};
use crate::logger::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application name for config file storage.
const APP_NAME: &str = "xlctl";

/// Config file name inside the application config directory.
const CONFIG_FILENAME: &str = "config.toml";

/// Minimum supported toolstack version (4.5).
pub const REQUIRED_VERSION: u32 = 4_005_000;

/// Default log buffer capacity in bytes.
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 1024;

/// Default upper bound on vCPUs per domain.
pub const DEFAULT_MAX_VCPUS: u32 = 128;

/// Toolstack logger settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Messages below this level are discarded.
    pub min_level: LogLevel,

    /// Suppress all progress output.
    pub hide_progress: bool,

    /// Capacity of the line buffer in bytes.
    pub buffer_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            hide_progress: false,
            buffer_size: DEFAULT_LOG_BUFFER_SIZE,
        }
    }
}

/// Control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    /// Toolstack logger settings.
    pub log: LogConfig,

    /// Minimum toolstack version, encoded as `major * 1_000_000 + minor * 1_000`.
    pub required_version: u32,

    /// Refuse to start when a legacy xend daemon is running.
    pub check_xend: bool,

    /// Upper bound on vCPUs per domain.
    pub max_vcpus: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            required_version: REQUIRED_VERSION,
            check_xend: true,
            max_vcpus: DEFAULT_MAX_VCPUS,
        }
    }
}

impl ControlConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Get the default config file path.
    ///
    /// On Linux: `~/.config/xlctl/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Check field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_vcpus == 0 {
            return Err(Error::Config("max_vcpus must be at least 1".into()));
        }
        Ok(())
    }
}
