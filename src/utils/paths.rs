//! Cross-Platform Path Utilities
//!
//! Resolves the application directory (~/.insight-desktop/) and the files
//! kept beneath it.

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the application directory (~/.insight-desktop/)
pub fn app_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".insight-desktop"))
}

/// Get the config file path (~/.insight-desktop/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(app_dir()?.join("config.json"))
}

/// Get the persisted results directory (~/.insight-desktop/results/)
pub fn results_dir() -> AppResult<PathBuf> {
    Ok(app_dir()?.join("results"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
