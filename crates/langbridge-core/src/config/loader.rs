//! Configuration file discovery and loading

use super::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "langbridge.toml";

/// Implicit lookup locations, in order: working directory, then user config
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("langbridge").join("config.toml"));
    }
    paths
}

impl BridgeConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            BridgeError::Config(message) => {
                BridgeError::config(format!("{} ({})", message, path.display()))
            }
            other => other,
        })
    }

    /// Load from an explicit path, else the first implicit location that
    /// exists, else built-in defaults
    ///
    /// Returns the path the configuration came from, if any.
    pub fn find_and_load(explicit: Option<&Path>) -> BridgeResult<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            let config = Self::load(path)?;
            info!(path = %path.display(), "Loaded configuration");
            return Ok((config, Some(path.to_path_buf())));
        }

        for path in default_config_paths() {
            if path.is_file() {
                let config = Self::load(&path)?;
                info!(path = %path.display(), "Loaded configuration");
                return Ok((config, Some(path)));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok((Self::default(), None))
    }
}
