//! Engine configuration.
//!
//! # Invariants
//! - Directories are absolute.
//! - `default_page_size` is non-zero.

use crate::logging::default_log_level;
use crate::model::view::DEFAULT_PAGE_SIZE;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    RelativePath { field: &'static str, path: PathBuf },
    ZeroPageSize,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RelativePath { field, path } => {
                write!(f, "{field} must be absolute, got `{}`", path.display())
            }
            Self::ZeroPageSize => write!(f, "default_page_size must be greater than zero"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Live attribute views live under `<data_dir>/storage/av/`.
    pub data_dir: PathBuf,
    /// Archives live under `<history_dir>/<YYYY-MM-DD-HHMMSS>*/`.
    pub history_dir: PathBuf,
    pub default_page_size: usize,
    pub log_level: String,
}

impl EngineConfig {
    /// Workspace layout: `<dir>/data` and `<dir>/history`.
    pub fn from_workspace(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let config = Self {
            data_dir: dir.join("data"),
            history_dir: dir.join("history"),
            default_page_size: DEFAULT_PAGE_SIZE,
            log_level: default_log_level().to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, path) in [("data_dir", &self.data_dir), ("history_dir", &self.history_dir)] {
            if !path.is_absolute() {
                return Err(ConfigError::RelativePath {
                    field,
                    path: path.clone(),
                });
            }
        }
        if self.default_page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(())
    }

    /// Directory for log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("attrview");
        Self {
            data_dir: base.join("data"),
            history_dir: base.join("history"),
            default_page_size: DEFAULT_PAGE_SIZE,
            log_level: default_log_level().to_string(),
        }
    }
}
