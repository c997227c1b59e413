use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub source: PathBuf,
    pub store: PathBuf,
    pub exclude: Vec<String>,
    pub retention: RetentionConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub max_age_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub remote: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("."),
            store: PathBuf::from("./backups"),
            exclude: vec![
                "**/.git/*".to_string(),
                "**/cache/*".to_string(),
                "**/tmp/*".to_string(),
                "*.swp".to_string(),
            ],
            retention: RetentionConfig { max_age_days: 90 },
            transport: TransportConfig { remote: None },
        }
    }
}

impl VaultConfig {
    /// Load config from file or create default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            debug!("config file not found, creating default");
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config from an explicit path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        debug!("loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| VaultError::Config {
            reason: format!("failed to read config file: {e}"),
        })?;

        serde_yaml::from_str(&content).map_err(|e| VaultError::Config {
            reason: format!("failed to parse config file: {e}"),
        })
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| VaultError::Config {
                reason: format!("failed to create config directory: {e}"),
            })?;
        }

        let content = serde_yaml::to_string(self).map_err(|e| VaultError::Config {
            reason: format!("failed to serialize config: {e}"),
        })?;

        fs::write(&config_path, content).map_err(|e| VaultError::Config {
            reason: format!("failed to write config file: {e}"),
        })?;

        debug!("config saved to {}", config_path.display());
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| VaultError::Config {
            reason: "could not determine config directory".to_string(),
        })?;

        Ok(config_dir.join("snapvault").join("config.yaml"))
    }

    /// Validate config settings
    pub fn validate(&self) -> Result<()> {
        if self.retention.max_age_days == 0 {
            return Err(VaultError::Config {
                reason: "retention max_age_days must be greater than 0".to_string(),
            });
        }

        if self.source == self.store {
            return Err(VaultError::Config {
                reason: "source and store must be different directories".to_string(),
            });
        }

        if self.retention.max_age_days < 7 {
            warn!(
                "short retention configured: {} day(s)",
                self.retention.max_age_days
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VaultConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retention.max_age_days, 90);
        assert!(!config.exclude.is_empty());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut config = VaultConfig::default();
        config.retention.max_age_days = 0;
        assert!(matches!(
            config.validate(),
            Err(VaultError::Config { .. })
        ));
    }

    #[test]
    fn test_source_equal_to_store_rejected() {
        let mut config = VaultConfig::default();
        config.store = config.source.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = VaultConfig::default();
        config.transport.remote = Some("s3://vault".to_string());
        fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = VaultConfig::load_from(&path).unwrap();
        assert_eq!(loaded.transport.remote.as_deref(), Some("s3://vault"));
        assert_eq!(loaded.retention.max_age_days, config.retention.max_age_days);
    }
}
