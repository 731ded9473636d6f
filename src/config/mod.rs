//! Configuration management for doccache

pub mod schema;

pub use schema::{CacheConfig, Config, CreationPolicy, ErrorPolicy, GeneralConfig, ReleasePolicy};

use crate::error::{CacheError, CacheResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable overriding `cache.max_size`
pub const ENV_MAX_SIZE: &str = "DOCCACHE_MAX_SIZE";

/// Environment variable overriding `cache.max_age_secs`
pub const ENV_MAX_AGE_SECS: &str = "DOCCACHE_MAX_AGE_SECS";

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
            .join("doccache")
            .join("config.toml")
    }

    /// Load configuration, falling back to defaults, then apply environment
    /// overrides
    pub fn load(&self) -> CacheResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path)?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };

        apply_env_overrides(&mut config.cache)?;
        config.cache.validate().map_err(|e| CacheError::ConfigInvalid {
            path: self.config_path.clone(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(&self, path: &Path) -> CacheResult<Config> {
        let content = fs::read_to_string(path)
            .map_err(|e| CacheError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| CacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub fn save(&self, config: &Config) -> CacheResult<()> {
        self.ensure_config_dir()?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).map_err(|e| {
            CacheError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    fn ensure_config_dir(&self) -> CacheResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::ConfigDirCreate {
                path: parent.to_path_buf(),
                source: e,
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

/// Overlay `DOCCACHE_*` environment variables onto cache settings
pub fn apply_env_overrides(cache: &mut CacheConfig) -> CacheResult<()> {
    if let Some(size) = env_number(ENV_MAX_SIZE, "max_size")? {
        cache.max_size = size as usize;
    }
    if let Some(age) = env_number(ENV_MAX_AGE_SECS, "max_age_secs")? {
        cache.max_age_secs = age;
    }
    Ok(())
}

fn env_number(var: &str, name: &'static str) -> CacheResult<Option<u64>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| CacheError::invalid_setting(name, format!("{var}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var(ENV_MAX_SIZE);
        std::env::remove_var(ENV_MAX_AGE_SECS);
    }

    #[test]
    #[serial]
    fn load_default_when_missing() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().unwrap();
        assert_eq!(config.cache.max_size, 10);
        assert_eq!(config.cache.max_age_secs, 300);
    }

    #[test]
    #[serial]
    fn save_and_load_roundtrip() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.cache.max_size = 3;
        config.cache.release = ReleasePolicy::Close;

        manager.save(&config).unwrap();
        let loaded = manager.load().unwrap();

        assert_eq!(loaded.cache, config.cache);
    }

    #[test]
    #[serial]
    fn env_overrides_file_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[cache]\nmax_size = 3\nmax_age_secs = 60\n").unwrap();

        std::env::set_var(ENV_MAX_SIZE, "25");
        let config = ConfigManager::with_path(path).load();
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.cache.max_size, 25);
        assert_eq!(config.cache.max_age_secs, 60);
    }

    #[test]
    #[serial]
    fn malformed_env_value_is_an_error() {
        std::env::set_var(ENV_MAX_AGE_SECS, "five minutes");
        let mut cache = CacheConfig::default();
        let result = apply_env_overrides(&mut cache);
        clear_env();

        assert!(matches!(
            result,
            Err(CacheError::InvalidSetting {
                name: "max_age_secs",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn invalid_file_is_reported_with_path() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[cache]\nmax_size = 0\n").unwrap();

        let err = ConfigManager::with_path(path.clone()).load().unwrap_err();
        match err {
            CacheError::ConfigInvalid { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
