//! Configuration Error Types
//!
//! Errors raised while loading, merging and validating bridge configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Explicitly requested configuration file does not exist
    #[error("Configuration file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    /// A source could not be read or parsed by the `config` crate
    #[error("Failed to load configuration: {error}")]
    LoadError { error: String },

    /// Deserializing the merged sources into `BridgeConfig` failed
    #[error("Failed to deserialize configuration: {error}")]
    DeserializeError { error: String },

    /// Invalid configuration value
    #[error("Invalid value for field '{field}': {context}")]
    InvalidValue { field: String, context: String },
}

impl ConfigurationError {
    pub fn invalid_value(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::LoadError {
            error: err.to_string(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
