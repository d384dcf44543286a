//! Configuration management for orbit.

pub mod paths;
pub mod settings;

pub use paths::config_file;
pub use settings::{AuthSettings, OrbitConfig, ProfileAuth};

use std::path::Path;

use crate::error::Result;

/// Load configuration from the default config file.
///
/// If the config file doesn't exist, returns default configuration.
pub fn load_config() -> Result<OrbitConfig> {
    let path = config_file()?;
    load_config_from(&path)
}

/// Load configuration from a specific path.
///
/// If the file doesn't exist, returns default configuration.
pub fn load_config_from(path: &Path) -> Result<OrbitConfig> {
    if !path.exists() {
        return Ok(OrbitConfig::default().with_env_overrides());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: OrbitConfig = toml::from_str(&contents)?;

    Ok(config.with_env_overrides())
}
