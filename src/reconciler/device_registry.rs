//! # Device Registry
//!
//! Maps satellite mobile ids to the device they belong to on the management
//! plane and to the device model that translates their property writes.
//! Completions only carry a mobile id, so this is how they find their way
//! back to the right shadow.

use super::device_model::{DeviceModel, DeviceModelError};
use super::idp_default::IdpDefaultModel;
use crate::config::ReconcilerConfig;
use crate::error::{BridgeError, BridgeResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A device known to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContext {
    pub device_id: String,
    pub mobile_id: String,
    pub model: String,
}

/// Device ids are alphanumeric plus `-._:`, ending in an alphanumeric or hyphen
fn is_valid_device_id(device_id: &str) -> bool {
    device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'))
        && device_id
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '-')
}

pub struct DeviceRegistry {
    config: ReconcilerConfig,
    models: RwLock<HashMap<String, Arc<dyn DeviceModel>>>,
    devices: DashMap<String, DeviceContext>,
}

impl DeviceRegistry {
    /// Registry with the built-in models registered
    pub fn new(config: ReconcilerConfig) -> Self {
        let registry = Self {
            config,
            models: RwLock::new(HashMap::new()),
            devices: DashMap::new(),
        };
        registry.register_model(Arc::new(IdpDefaultModel::new()));
        registry
    }

    pub fn register_model(&self, model: Arc<dyn DeviceModel>) {
        debug!(model = model.name(), "Registering device model");
        self.models.write().insert(model.name().to_string(), model);
    }

    pub fn model(&self, name: &str) -> Result<Arc<dyn DeviceModel>, DeviceModelError> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceModelError::UnknownModel(name.to_string()))
    }

    pub fn model_for(&self, device: &DeviceContext) -> Result<Arc<dyn DeviceModel>, DeviceModelError> {
        self.model(&device.model)
    }

    /// Register a mobile under `model` (or the configured default model).
    /// Re-registering replaces the previous context.
    pub fn register_device(&self, mobile_id: &str, model: Option<&str>) -> BridgeResult<DeviceContext> {
        let model = model.unwrap_or(&self.config.default_model).to_string();
        self.model(&model)?;

        let device_id = self.config.device_id_for(mobile_id);
        if mobile_id.trim().is_empty() || !is_valid_device_id(&device_id) {
            return Err(BridgeError::ValidationError(format!(
                "Invalid device id '{device_id}' for mobile '{mobile_id}'"
            )));
        }

        let context = DeviceContext {
            device_id,
            mobile_id: mobile_id.to_string(),
            model,
        };
        self.devices.insert(mobile_id.to_string(), context.clone());
        Ok(context)
    }

    pub fn device(&self, mobile_id: &str) -> Option<DeviceContext> {
        self.devices.get(mobile_id).map(|entry| entry.value().clone())
    }

    /// Known device, or a new registration under the default model
    pub fn device_or_default(&self, mobile_id: &str) -> BridgeResult<DeviceContext> {
        match self.device(mobile_id) {
            Some(context) => Ok(context),
            None => self.register_device(mobile_id, None),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_device_uses_id_format() {
        let registry = DeviceRegistry::default();
        let device = registry.register_device("01459438SKYFEE3", None).unwrap();
        assert_eq!(device.device_id, "idp-01459438SKYFEE3");
        assert_eq!(device.model, "idpDefault");
        assert_eq!(registry.device("01459438SKYFEE3"), Some(device));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let registry = DeviceRegistry::default();
        let err = registry
            .register_device("01459438SKYFEE3", Some("mailbox"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeviceModelError(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        let registry = DeviceRegistry::default();
        assert!(registry.register_device("bad id!", None).is_err());
        assert!(registry.register_device("", None).is_err());
    }

    #[test]
    fn test_device_or_default_registers_once() {
        let registry = DeviceRegistry::default();
        let first = registry.device_or_default("01097623SKY2C68").unwrap();
        let second = registry.device_or_default("01097623SKY2C68").unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_device_id_validation() {
        assert!(is_valid_device_id("idp-01459438SKYFEE3"));
        assert!(is_valid_device_id("a.b_c:d-"));
        assert!(is_valid_device_id("idp-x"));
        assert!(!is_valid_device_id("idp x"));
        assert!(!is_valid_device_id("idp_"));
        assert!(!is_valid_device_id(""));
    }
}
