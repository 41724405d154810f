//! Twin store double.
//!
//! Patches are applied to the reported side the way a twin service would:
//! entries overlay the existing ones and the reported version increments.
//! A device that was never stored reads as a freshly provisioned twin.

use crate::models::{DesiredProperty, DeviceShadow, ShadowPatch};
use crate::reconciler::{ShadowClient, ShadowError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct InMemoryShadowClient {
    shadows: DashMap<String, DeviceShadow>,
    writes: Mutex<Vec<(String, ShadowPatch)>>,
    fail_reads: AtomicBool,
}

fn provisioned() -> DeviceShadow {
    DeviceShadow {
        desired_version: 1,
        reported_version: 1,
        ..Default::default()
    }
}

impl InMemoryShadowClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device_id: &str, shadow: DeviceShadow) {
        self.shadows.insert(device_id.to_string(), shadow);
    }

    /// Set a desired property. Like a twin, the desired document version moves
    /// and every desired property takes the new version.
    pub fn set_desired(&self, device_id: &str, name: &str, value: Value) -> u64 {
        let mut shadow = self
            .shadows
            .entry(device_id.to_string())
            .or_insert_with(provisioned);
        shadow.desired_version += 1;
        let version = shadow.desired_version;
        shadow.desired.insert(
            name.to_string(),
            DesiredProperty { value, version },
        );
        for desired in shadow.desired.values_mut() {
            desired.version = version;
        }
        version
    }

    pub fn shadow(&self, device_id: &str) -> Option<DeviceShadow> {
        self.shadows.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn writes(&self) -> Vec<(String, ShadowPatch)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShadowClient for InMemoryShadowClient {
    async fn read_device_shadow(&self, device_id: &str) -> Result<DeviceShadow, ShadowError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ShadowError::Unavailable(format!("read of {device_id} refused")));
        }
        Ok(self.shadow(device_id).unwrap_or_else(provisioned))
    }

    async fn write_shadow_patch(
        &self,
        device_id: &str,
        patch: &ShadowPatch,
    ) -> Result<(), ShadowError> {
        {
            let mut shadow = self
                .shadows
                .entry(device_id.to_string())
                .or_insert_with(provisioned);
            shadow.reported.extend(patch.properties.clone());
            shadow.reported_version += 1;
        }
        self.writes
            .lock()
            .push((device_id.to_string(), patch.clone()));
        Ok(())
    }
}
