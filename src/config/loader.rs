//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered with the
//! `config` crate, later sources overriding earlier ones:
//!
//! 1. Built-in defaults (`EngineConfig::default()`)
//! 2. `<config_dir>/engine.{yaml,toml,json}`
//! 3. `<config_dir>/engine.<environment>.{yaml,toml,json}`
//! 4. Environment variables such as `TASKER_ENGINE__PARTITIONS__COUNT=20`

use super::error::{ConfigResult, ConfigurationError};
use super::EngineConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix for environment variable overrides
const ENV_PREFIX: &str = "TASKER_ENGINE";

/// Loaded, validated configuration together with where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading engine configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            partitions = config.partitions.count,
            partition_capacity = config.partitions.max_capacity,
            replication_factor = config.event_store.replication_factor,
            "⚙️ CONFIG: Engine configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: EngineConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect the running environment from the usual variables
    pub fn detect_environment() -> String {
        env::var("TASKER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("TASKER_ENGINE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(config_directory: &Path, environment: &str) -> ConfigResult<EngineConfig> {
        let defaults = Config::try_from(&EngineConfig::default())
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let base_path = config_directory.join("engine");
        let env_path = config_directory.join(format!("engine.{environment}"));

        let merged = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name(&base_path.to_string_lossy()).required(false))
            .add_source(File::with_name(&env_path.to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        merged
            .try_deserialize::<EngineConfig>()
            .map_err(|e| ConfigurationError::DeserializationError {
                error: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();

        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().partitions.count, 10);
        assert_eq!(manager.config().pools.normal.max_concurrency, 500);
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("engine.yaml"),
            "partitions:\n  count: 4\n  max_capacity: 25\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("engine.staging.yaml"),
            "partitions:\n  max_capacity: 40\nconsistency:\n  max_wait_ms: 1000\n",
        )
        .unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "staging")
                .unwrap();
        let config = manager.config();

        assert_eq!(config.partitions.count, 4);
        assert_eq!(config.partitions.max_capacity, 40);
        assert_eq!(config.consistency.max_wait_ms, 1_000);
        // Untouched sections keep their defaults
        assert_eq!(config.event_store.replication_factor, 3);
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("engine.yaml"),
            "scoring:\n  load: 0.9\n",
        )
        .unwrap();

        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = EngineConfig::default();
        config.partitions.count = 0;
        assert!(ConfigManager::from_config(config, "test").is_err());
    }
}
