//! Configuration loading for the CLI.
//!
//! The file is read before logging is installed (its `[log]` section picks
//! the filter), so the outcome is kept in a [`LoadedConfig`] and reported
//! once tracing is up.

use std::path::{Path, PathBuf};
use tether_types::TetherConfig;
use tracing::{info, warn};

/// How the configuration was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    /// The file exists but could not be used; defaults were substituted.
    Invalid { path: PathBuf, error: String },
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TetherConfig,
    pub source: ConfigSource,
}

impl LoadedConfig {
    /// Log where the configuration came from.
    pub fn report(&self) {
        match &self.source {
            ConfigSource::File(path) => {
                info!(path = %path.display(), "Loaded configuration");
            }
            ConfigSource::Missing(path) => {
                info!(path = %path.display(), "Config file not found, using defaults");
            }
            ConfigSource::Invalid { path, error } => {
                warn!(
                    error = %error,
                    path = %path.display(),
                    "Failed to load config, using defaults"
                );
            }
        }
    }
}

/// Load configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> LoadedConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        return LoadedConfig {
            config: TetherConfig::default(),
            source: ConfigSource::Missing(config_path),
        };
    }

    let parsed = std::fs::read_to_string(&config_path)
        .map_err(|e| e.to_string())
        .and_then(|contents| toml::from_str::<TetherConfig>(&contents).map_err(|e| e.to_string()))
        .and_then(|config| config.validate().map(|()| config));

    match parsed {
        Ok(config) => LoadedConfig {
            config,
            source: ConfigSource::File(config_path),
        },
        Err(error) => LoadedConfig {
            config: TetherConfig::default(),
            source: ConfigSource::Invalid {
                path: config_path,
                error,
            },
        },
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    tether_home().join("config.toml")
}

/// Get the Tether home directory.
pub fn tether_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tether")
}
