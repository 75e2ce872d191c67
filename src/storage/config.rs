//! JSON Configuration Management
//!
//! Handles reading and writing the analysis configuration file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::models::settings::{AnalysisConfig, AnalysisConfigUpdate};
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{config_path, ensure_dir};

/// Configuration service for managing analysis settings
#[derive(Debug)]
pub struct ConfigService {
    config_path: PathBuf,
    config: AnalysisConfig,
}

impl ConfigService {
    /// Create a config service for ~/.insight-desktop/config.json
    pub fn new() -> AppResult<Self> {
        Self::with_path(config_path()?)
    }

    /// Create a config service backed by `path`, loading the existing file or
    /// writing defaults when it is missing.
    pub fn with_path(path: impl Into<PathBuf>) -> AppResult<Self> {
        let config_path = path.into();
        if let Some(parent) = config_path.parent() {
            ensure_dir(parent)?;
        }

        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            tracing::info!("[Config] No config at {}, writing defaults", config_path.display());
            let default_config = AnalysisConfig::default();
            Self::save_to_file(&config_path, &default_config)?;
            default_config
        };

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> AppResult<AnalysisConfig> {
        let content = fs::read_to_string(path)?;
        let config: AnalysisConfig = serde_json::from_str(&content)?;
        config.validate().map_err(AppError::validation)?;
        Ok(config)
    }

    /// Save configuration to a file with pretty formatting
    fn save_to_file(path: &Path, config: &AnalysisConfig) -> AppResult<()> {
        config.validate().map_err(AppError::validation)?;
        let content = serde_json::to_string_pretty(config)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the current configuration
    pub fn get_config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Update the configuration with a partial update.
    ///
    /// The update is rejected, and the stored config left untouched, when the
    /// result would not validate.
    pub fn update_config(&mut self, update: AnalysisConfigUpdate) -> AppResult<AnalysisConfig> {
        let mut next = self.config.clone();
        next.apply_update(update);
        Self::save_to_file(&self.config_path, &next)?;
        self.config = next;
        Ok(self.config.clone())
    }

    /// Reset configuration to defaults
    pub fn reset(&mut self) -> AppResult<()> {
        self.config = AnalysisConfig::default();
        Self::save_to_file(&self.config_path, &self.config)
    }
}
