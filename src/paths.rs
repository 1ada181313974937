//! Centralized path utilities for the application.

use std::fs;
use std::path::PathBuf;

use crate::error::{AppError, Result};

/// Get the root data directory for the application (~/.tunnel_pilot).
pub fn get_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| AppError::io("Cannot find home directory"))?;
    Ok(home.join(".tunnel_pilot"))
}

/// Get the path to the config file.
pub fn config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.toml"))
}

/// Directory holding composed engine configs while an engine reads them.
pub fn get_run_dir() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("run"))
}

/// Ensure all required data directories exist.
pub fn ensure_data_dirs() -> Result<()> {
    let base = get_data_dir()?;
    fs::create_dir_all(&base).map_err(|e| AppError::io(e.to_string()))?;
    fs::create_dir_all(base.join("run")).map_err(|e| AppError::io(e.to_string()))?;
    Ok(())
}
