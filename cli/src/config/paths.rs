//! Platform-specific path utilities for orbit.

use std::path::PathBuf;

use crate::error::{OrbitError, Result};

/// Get the configuration directory for orbit.
///
/// - Linux: `~/.config/orbit`
/// - macOS: `~/Library/Application Support/orbit`
/// - Windows: `%APPDATA%\orbit`
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| OrbitError::Config("Cannot determine config directory".to_string()))?;
    Ok(base.join("orbit"))
}

/// Get the main configuration file path.
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Directory used for token files when the OS keyring is unavailable.
pub fn tokens_dir() -> Result<PathBuf> {
    Ok(config_dir()?.join("tokens"))
}
