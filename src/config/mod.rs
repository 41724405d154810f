//! # Bridge Configuration System
//!
//! Layered configuration for the orchestrator, the delivery deadline model, the
//! garbage collector and the shadow reconciler. Every value has a compiled
//! default so a bare deployment runs without any file present.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use satcom_bridge::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let sending_timeout = manager.config().orchestration.sending_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::defaults;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring config/satcom-bridge.toml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Per-stage wait limits and runner sizing
    pub orchestration: OrchestrationConfig,

    /// Low-power delivery deadline model
    pub delivery_deadline: DeliveryDeadlineConfig,

    /// Garbage collection of stale and finished instances
    pub cleanup: CleanupConfig,

    /// Device shadow reconciliation
    pub reconciler: ReconcilerConfig,

    /// Durable instance store
    pub database: DatabaseConfig,

    /// Outbound event channel
    pub events: EventsConfig,
}

impl BridgeConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let orchestration = &self.orchestration;
        for (field, value) in [
            ("orchestration.sending_timeout_seconds", orchestration.sending_timeout_seconds),
            ("orchestration.delivery_timeout_seconds", orchestration.delivery_timeout_seconds),
            ("orchestration.response_timeout_seconds", orchestration.response_timeout_seconds),
            ("cleanup.instance_max_age_seconds", self.cleanup.instance_max_age_seconds),
            ("cleanup.sweep_interval_seconds", self.cleanup.sweep_interval_seconds),
        ] {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(field, "must be greater than zero"));
            }
        }

        if orchestration.mailbox_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.mailbox_capacity",
                "must be greater than zero",
            ));
        }

        if self.delivery_deadline.size_block_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "delivery_deadline.size_block_bytes",
                "must be greater than zero",
            ));
        }

        if self.cleanup.retention_seconds < self.cleanup.instance_max_age_seconds {
            return Err(ConfigurationError::invalid_value(
                "cleanup.retention_seconds",
                "must not be shorter than instance_max_age_seconds",
            ));
        }

        if !self.reconciler.device_id_format.contains("${mobileId}") {
            return Err(ConfigurationError::invalid_value(
                "reconciler.device_id_format",
                "must contain the ${mobileId} placeholder",
            ));
        }

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Stage wait limits for the command orchestrator
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Wait for the network to pick up a submitted message
    pub sending_timeout_seconds: u64,
    /// Base wait for delivery when no scheduled wake time is known
    pub delivery_timeout_seconds: u64,
    /// Wait for the device's reply once delivered
    pub response_timeout_seconds: u64,
    /// Buffered signals per waiting instance
    pub mailbox_capacity: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            sending_timeout_seconds: defaults::SENDING_TIMEOUT_SECONDS,
            delivery_timeout_seconds: defaults::DELIVERY_TIMEOUT_SECONDS,
            response_timeout_seconds: defaults::RESPONSE_TIMEOUT_SECONDS,
            mailbox_capacity: defaults::MAILBOX_CAPACITY,
        }
    }
}

impl OrchestrationConfig {
    pub fn sending_timeout(&self) -> Duration {
        Duration::from_secs(self.sending_timeout_seconds)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_seconds)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_seconds)
    }
}

/// Extra delivery time granted for low-power links and large payloads
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryDeadlineConfig {
    pub grace_seconds: u64,
    /// Added per started block of `size_block_bytes` above the threshold
    pub grace_increment_seconds: u64,
    pub size_threshold_bytes: usize,
    pub size_block_bytes: usize,
}

impl Default for DeliveryDeadlineConfig {
    fn default() -> Self {
        Self {
            grace_seconds: defaults::DELIVERY_GRACE_SECONDS,
            grace_increment_seconds: defaults::DELIVERY_GRACE_INCREMENT_SECONDS,
            size_threshold_bytes: defaults::DELIVERY_SIZE_THRESHOLD_BYTES,
            size_block_bytes: defaults::DELIVERY_SIZE_BLOCK_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub sweep_interval_seconds: u64,
    /// Non-terminal instances older than this are forced to TimedOut
    pub instance_max_age_seconds: u64,
    /// Terminal instances idle longer than this are purged
    pub retention_seconds: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_seconds: defaults::CLEANUP_SWEEP_INTERVAL_SECONDS,
            instance_max_age_seconds: defaults::INSTANCE_MAX_AGE_SECONDS,
            retention_seconds: defaults::INSTANCE_RETENTION_SECONDS,
        }
    }
}

impl CleanupConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn instance_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.instance_max_age_seconds as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_seconds as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Device id template, `${mobileId}` is substituted
    pub device_id_format: String,
    /// Model used for devices without a registered template
    pub default_model: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            device_id_format: defaults::DEVICE_ID_FORMAT.to_string(),
            default_model: defaults::DEFAULT_DEVICE_MODEL.to_string(),
        }
    }
}

impl ReconcilerConfig {
    pub fn device_id_for(&self, mobile_id: &str) -> String {
        self.device_id_format.replace("${mobileId}", mobile_id)
    }
}

/// Postgres instance store; in-memory storage is used when `url` is unset
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestration.sending_timeout(), Duration::from_secs(300));
        assert_eq!(config.reconciler.device_id_for("01459438SKYFEE3"), "idp-01459438SKYFEE3");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = BridgeConfig::default();
        config.orchestration.response_timeout_seconds = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("response_timeout_seconds"));
    }

    #[test]
    fn test_retention_shorter_than_max_age_rejected() {
        let mut config = BridgeConfig::default();
        config.cleanup.retention_seconds = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_id_format_requires_placeholder() {
        let mut config = BridgeConfig::default();
        config.reconciler.device_id_format = "device".to_string();
        assert!(config.validate().is_err());
    }
}
