//! Configuration directory helpers for Bazaar services
//!
//! Every Bazaar binary keeps its settings, credentials and local database in
//! one shared directory, `~/.config/bazaar/` by default. Set
//! `BAZAAR_CONFIG_DIR` to relocate it (tests and containerized deployments).
//!
//! Call [`init`] at startup to make sure the directory exists.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the config directory location
pub const CONFIG_DIR_ENV: &str = "BAZAAR_CONFIG_DIR";

/// Initialize the Bazaar config directory, creating it if needed.
pub fn init() -> Result<PathBuf> {
    ensure_config_dir()
}

/// Resolve the config directory (`$BAZAAR_CONFIG_DIR` or ~/.config/bazaar/)
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|p| p.join("bazaar"))
}

/// Path of a file inside the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Check whether a file exists inside the config directory
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Load and parse a JSON file from the config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Load a JSON file from the config directory, falling back to
/// `T::default()` when the file is absent.
///
/// A file that exists but fails to parse is still an error: silently running
/// with defaults would hide a typo in a production setting.
pub fn load_json_or_default<T: DeserializeOwned + Default>(filename: &str) -> Result<T> {
    if config_exists(filename) {
        load_json(filename)
    } else {
        Ok(T::default())
    }
}

/// Read and parse one JSON file
fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Create the config directory if it does not exist yet
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}
