#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # Satcom Bridge
//!
//! Bridges an intermittently connected satellite messaging network to a cloud
//! device-management plane.
//!
//! ## Overview
//!
//! Two engines do the work:
//!
//! - **Command orchestration**: every OTA command runs as one durable,
//!   suspendable instance that advances `Submitting -> Sending -> Delivering ->
//!   (AwaitingResponse) -> Completed | Failed | TimedOut`. Each waiting stage
//!   races a correlated network event against a stage deadline, and the state
//!   is persisted after every transition so a restart resumes the wait instead
//!   of re-submitting.
//! - **Shadow reconciliation**: desired vs. reported device properties are
//!   diffed under an ack-code/ack-version protocol, new writes are dispatched
//!   through the orchestrator and command completions are folded back into the
//!   shadow.
//!
//! ## Module Organization
//!
//! - [`models`] - Commands, delivery results, instances, device shadows
//! - [`correlation`] - Attribute-keyed routing of network events to instances
//! - [`timeout`] - Cancellable stage timers and the low-power delivery deadline
//! - [`state_machine`] - Command lifecycle, transitions and instance stores
//! - [`orchestration`] - Instance runners, front end and garbage collection
//! - [`reconciler`] - Device models, diff planning and the shadow reconciler
//! - [`database`] - Postgres instance store and migrations
//! - [`events`] - Inbound network events and the orchestration event channel
//! - [`config`] - Layered configuration
//! - [`bootstrap`] - Wiring everything into a running system
//!
//! ## Quick Start
//!
//! The network and the device-management plane are reached through the
//! [`orchestration::CommandSubmitter`] and [`reconciler::ShadowClient`] traits;
//! plug in clients for your deployment:
//!
//! ```rust,no_run
//! use satcom_bridge::bootstrap::{BootstrapConfig, BridgeBootstrap};
//! use satcom_bridge::orchestration::CommandSubmitter;
//! use satcom_bridge::reconciler::ShadowClient;
//! use std::sync::Arc;
//!
//! async fn run(
//!     submitter: Arc<dyn CommandSubmitter>,
//!     shadows: Arc<dyn ShadowClient>,
//! ) -> satcom_bridge::BridgeResult<()> {
//!     let handle = BridgeBootstrap::bootstrap(BootstrapConfig::default(), submitter, shadows).await?;
//!
//!     let report = handle
//!         .reconciler
//!         .run_pass_for_mobile("01459438SKYFEE3", None)
//!         .await?;
//!     println!("dispatched {} commands", report.dispatched.len());
//!     Ok(())
//! }
//! ```
//!
//! In-memory clients for tests live in `test_helpers`, behind the
//! `test-helpers` feature.

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod reconciler;
pub mod state_machine;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod timeout;

pub use config::{BridgeConfig, ConfigManager};
pub use error::{BridgeError, BridgeResult};
pub use orchestration::{CommandOrchestrator, StartOutcome};
pub use reconciler::ShadowReconciler;
