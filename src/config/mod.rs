//! Configuration management for mkimage

pub mod schema;

pub use schema::Config;

use crate::error::{MkimageError, MkimageResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mkimage")
            .join("config.toml")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub async fn load(&self) -> MkimageResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration, failing if the file is missing
    pub async fn load_required(&self) -> MkimageResult<Config> {
        if !self.config_path.exists() {
            return Err(MkimageError::ConfigNotFound(self.config_path.clone()));
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> MkimageResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| MkimageError::io(format!("reading config from {}", path.display()), e))?;

        let config: Config = toml::from_str(&content).map_err(|e| MkimageError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Surface overlapping namespaces at load time rather than on first request
        config
            .cache
            .layout()
            .map_err(|e| MkimageError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> MkimageResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            MkimageError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> MkimageResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MkimageError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the cache and working roots exist
    pub async fn ensure_cache_dirs(config: &Config) -> MkimageResult<()> {
        let dirs = [&config.cache.cache_dir, &config.cache.work_dir];

        for dir in dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                MkimageError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
