//! # Data Models
//!
//! Commands, delivery outcomes, orchestration instances and device shadows.

pub mod command;
pub mod delivery;
pub mod instance;
pub mod shadow;

pub use command::{CommandPayload, CommandRequest, CompletionSpec, OtaCommandSpec, PayloadField};
pub use delivery::{DeliveryReason, DeliveryResult, ResponseMessage};
pub use instance::{InstanceId, OrchestrationInstance};
pub use shadow::{AckStatus, DesiredProperty, DeviceShadow, PropertyState, ReportedValue, ShadowPatch};
