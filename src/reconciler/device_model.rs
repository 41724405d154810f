//! # Device Model Capability
//!
//! A device model knows which shadow properties of a device family are
//! writable over the air and how a property write or a named command becomes
//! wire-level OTA command content.

use crate::models::{CompletionSpec, OtaCommandSpec, ResponseMessage, ShadowPatch};
use serde_json::Value;
use thiserror::Error;

/// Translation failures. `NotWritable` is reported as a 400 ack; every other
/// variant becomes a 500 ack on the affected property only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceModelError {
    #[error("Property {property} is not writable")]
    NotWritable { property: String },

    #[error("Invalid value for {property}: {reason}")]
    InvalidValue { property: String, reason: String },

    #[error("No command defined for {command}")]
    UnknownCommand { command: String },

    #[error("Unknown device model: {0}")]
    UnknownModel(String),
}

impl DeviceModelError {
    pub fn is_not_writable(&self) -> bool {
        matches!(self, Self::NotWritable { .. })
    }
}

impl From<DeviceModelError> for crate::error::BridgeError {
    fn from(err: DeviceModelError) -> Self {
        crate::error::BridgeError::DeviceModelError(err.to_string())
    }
}

pub type DeviceModelResult<T> = Result<T, DeviceModelError>;

pub trait DeviceModel: Send + Sync {
    /// Registry name of the model
    fn name(&self) -> &str;

    /// Baseline reported properties seeded on first contact
    fn initialize(&self, mobile_id: &str) -> ShadowPatch;

    fn is_writable(&self, property: &str) -> bool;

    /// Translate a desired-property write at `version` into an OTA command
    fn translate_write(
        &self,
        property: &str,
        value: &Value,
        version: u64,
    ) -> DeviceModelResult<OtaCommandSpec>;

    /// Translate an offline/direct command that bypasses the shadow
    fn translate_command(&self, command: &str, data: &Value) -> DeviceModelResult<OtaCommandSpec>;

    /// Value a successful command leaves on its property, read back from the
    /// device's reply. Defaults to a same-named field of the reply payload.
    fn response_value(
        &self,
        completion: &CompletionSpec,
        response: &ResponseMessage,
    ) -> Option<Value> {
        response
            .payload
            .get(&completion.property_name)
            .filter(|value| !value.is_null())
            .cloned()
    }
}
