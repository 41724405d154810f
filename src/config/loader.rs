//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered, later ones
//! overriding earlier ones:
//!
//! 1. compiled defaults (`BridgeConfig::default()`)
//! 2. `{config_dir}/satcom-bridge.toml`
//! 3. `{config_dir}/satcom-bridge.{environment}.toml`
//! 4. environment variables `SATCOM_BRIDGE__SECTION__FIELD`

use super::error::{ConfigResult, ConfigurationError};
use super::BridgeConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_STEM: &str = "satcom-bridge";
const ENV_PREFIX: &str = "SATCOM_BRIDGE";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: BridgeConfig,
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
            "Loading bridge configuration"
        );

        let base = config_directory.join(format!("{CONFIG_FILE_STEM}.toml"));
        let overlay = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}.toml"));

        let config = Self::build(Some(&base), Some(&overlay), false)?;
        Self::finish(config, environment, config_directory)
    }

    /// Load a single explicit file (plus defaults and environment variables)
    pub fn load_from_file(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        if !path.exists() {
            return Err(ConfigurationError::ConfigFileNotFound {
                path: path.to_path_buf(),
            });
        }
        let environment = Self::detect_environment();
        let config = Self::build(Some(path), None, true)?;
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_directory);
        Self::finish(config, &environment, directory)
    }

    /// Wrap an already-built configuration, validating it
    pub fn from_config(config: BridgeConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        Self::finish(config, environment, Self::default_config_directory())
    }

    fn build(
        base: Option<&Path>,
        overlay: Option<&Path>,
        base_required: bool,
    ) -> ConfigResult<BridgeConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&BridgeConfig::default())?);

        if let Some(base) = base {
            builder = builder.add_source(File::from(base).required(base_required));
        }
        if let Some(overlay) = overlay {
            builder = builder.add_source(File::from(overlay).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()?
            .try_deserialize::<BridgeConfig>()
            .map_err(|e| ConfigurationError::DeserializeError {
                error: e.to_string(),
            })
    }

    fn finish(
        config: BridgeConfig,
        environment: &str,
        config_directory: PathBuf,
    ) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;

        info!(
            environment = %environment,
            sending_timeout_seconds = config.orchestration.sending_timeout_seconds,
            delivery_timeout_seconds = config.orchestration.delivery_timeout_seconds,
            response_timeout_seconds = config.orchestration.response_timeout_seconds,
            persistent_store = config.database.url.is_some(),
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Detect the runtime environment from environment variables
    pub fn detect_environment() -> String {
        env::var("SATCOM_BRIDGE_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("SATCOM_BRIDGE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }
}
