//! # Device Shadow Reconciliation
//!
//! Drives devices toward their desired shadow state by dispatching OTA
//! commands through the orchestrator, and records the outcome of every write
//! on the reported side with an ack code and version.

pub mod clients;
pub mod device_model;
pub mod device_registry;
pub mod idp_default;
pub mod plan;
pub mod shadow_reconciler;

pub use clients::{ShadowClient, ShadowError};
pub use device_model::{DeviceModel, DeviceModelError, DeviceModelResult};
pub use device_registry::{DeviceContext, DeviceRegistry};
pub use idp_default::IdpDefaultModel;
pub use plan::{classify, is_first_contact, plan_reconciliation, PropertyDecision, ReconcilePlan};
pub use shadow_reconciler::{ReconcileReport, ShadowReconciler};
