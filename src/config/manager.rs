// Configuration loading and saving
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, debug};

use super::AppConfig;

pub type ConfigResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Loads and saves the application configuration as YAML or JSON
pub struct ConfigManager {
    config_path: PathBuf,
    config: Arc<RwLock<AppConfig>>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            config: Arc::new(RwLock::new(AppConfig::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn is_json(&self) -> bool {
        self.config_path.extension().and_then(|ext| ext.to_str()) == Some("json")
    }

    /// Load configuration from file, writing the defaults if it is missing
    pub async fn load(&self) -> ConfigResult<()> {
        if self.config_path.exists() {
            info!("Loading configuration from: {:?}", self.config_path);

            let content = fs::read_to_string(&self.config_path)?;
            let loaded_config: AppConfig = if self.is_json() {
                serde_json::from_str(&content)?
            } else {
                // Default to YAML
                serde_yaml::from_str(&content)?
            };

            *self.config.write().await = loaded_config;
            debug!("Configuration loaded successfully");
        } else {
            info!("Configuration file not found, using defaults: {:?}", self.config_path);
            self.save().await?;
        }

        Ok(())
    }

    /// Save configuration to file
    pub async fn save(&self) -> ConfigResult<()> {
        info!("Saving configuration to: {:?}", self.config_path);

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = render(&*self.config.read().await, self.is_json())?;
        fs::write(&self.config_path, content)?;
        debug!("Configuration saved successfully");

        Ok(())
    }

    /// Get a copy of the current configuration
    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }
}

/// Serialize a configuration as pretty JSON or YAML
pub fn render(config: &AppConfig, json: bool) -> ConfigResult<String> {
    Ok(if json {
        serde_json::to_string_pretty(config)?
    } else {
        serde_yaml::to_string(config)?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let manager = ConfigManager::new(path.clone());

        manager.load().await.unwrap();

        assert!(path.exists());
        let written: AppConfig = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.worker.max_queue_size, 100);
    }

    #[tokio::test]
    async fn test_json_file_is_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AppConfig::default();
        config.worker.pool_size = 7;
        config.fetcher.allowed_hosts = vec!["www.youtube.com".to_string()];
        fs::write(&path, render(&config, true).unwrap()).unwrap();

        let reloaded = ConfigManager::new(path);
        reloaded.load().await.unwrap();
        let config = reloaded.get_config().await;
        assert_eq!(config.worker.pool_size, 7);
        assert_eq!(config.fetcher.allowed_hosts, vec!["www.youtube.com".to_string()]);
    }
}
