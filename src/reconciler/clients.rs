//! Device-management plane contract used by the reconciler.

use crate::models::{DeviceShadow, ShadowPatch};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShadowError {
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("Device management unavailable: {0}")]
    Unavailable(String),

    #[error("Shadow patch rejected: {0}")]
    Rejected(String),

    #[error("Malformed shadow document: {0}")]
    Malformed(String),
}

impl From<ShadowError> for crate::error::BridgeError {
    fn from(err: ShadowError) -> Self {
        crate::error::BridgeError::ShadowError(err.to_string())
    }
}

impl From<serde_json::Error> for ShadowError {
    fn from(err: serde_json::Error) -> Self {
        ShadowError::Malformed(err.to_string())
    }
}

/// Twin store client. Shadows are always read fresh; implementations must not
/// cache across calls.
#[async_trait]
pub trait ShadowClient: Send + Sync {
    async fn read_device_shadow(&self, device_id: &str) -> Result<DeviceShadow, ShadowError>;

    async fn write_shadow_patch(&self, device_id: &str, patch: &ShadowPatch)
        -> Result<(), ShadowError>;
}
