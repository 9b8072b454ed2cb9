//! Service-wide configuration.
//!
//! The configuration file is a plain `label value` line file with two
//! optional entries, `totalCacheSpace` and `baseDirName`; anything
//! missing falls back to the built-in defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const LABEL_TOTAL_CACHE_SPACE: &str = "totalCacheSpace";
const LABEL_BASE_DIR_NAME: &str = "baseDirName";

/// Default total cache space (100 MiB).
pub const DEFAULT_TOTAL_CACHE_SPACE: u64 = 100 * 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// A config value could not be parsed
    #[error("invalid configuration: {label} = '{value}'")]
    InvalidValue { label: String, value: String },
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Upper bound on the space all cache types may use together.
    pub total_cache_space: u64,
    /// Root of the cache directory tree.
    pub base_dir: PathBuf,
    /// Default destination for copied-out objects.
    pub download_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let state_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("objstash");
        Self {
            total_cache_space: DEFAULT_TOTAL_CACHE_SPACE,
            base_dir: state_dir.join("objects"),
            download_dir: state_dir.join("downloads"),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from `path`.  A missing file yields the
    /// defaults; present labels override them individually.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)?;
        let mut tokens = contents.split_whitespace();
        while let Some(label) = tokens.next() {
            let Some(value) = tokens.next() else {
                break;
            };
            match label {
                LABEL_TOTAL_CACHE_SPACE => {
                    config.total_cache_space =
                        value.parse().map_err(|_| ConfigError::InvalidValue {
                            label: label.to_string(),
                            value: value.to_string(),
                        })?;
                    info!(total = config.total_cache_space, "configured total cache space");
                }
                LABEL_BASE_DIR_NAME => {
                    config.base_dir = PathBuf::from(value);
                    info!(base = %config.base_dir.display(), "configured base directory");
                }
                _ => {}
            }
        }

        Ok(config)
    }
}

/// The default location of the service configuration file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("objstash")
        .join("service.conf")
}

/// The default control-socket path for the daemon.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("objstash.sock")
}
