//! Error types for the satellite bridge.
//!

use crate::config::ConfigurationError;
use crate::models::InstanceId;
use crate::state_machine::errors::{PersistenceError, StateMachineError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error("Event error: {0}")]
    EventError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Submission error: {0}")]
    SubmissionError(String),
    #[error("Shadow error: {0}")]
    ShadowError(String),
    #[error("Device model error: {0}")]
    DeviceModelError(String),
    #[error("Persistence error: {0}")]
    PersistenceError(String),
    #[error("Timeout error for operation {operation}: {timeout_duration:?}")]
    Timeout {
        operation: String,
        timeout_duration: Duration,
    },
    #[error("Instance {instance_id} not found")]
    InstanceNotFound { instance_id: InstanceId },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(error: serde_json::Error) -> Self {
        BridgeError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::DatabaseError(err.to_string())
    }
}

impl From<ConfigurationError> for BridgeError {
    fn from(err: ConfigurationError) -> Self {
        BridgeError::ConfigurationError(err.to_string())
    }
}

impl From<StateMachineError> for BridgeError {
    fn from(err: StateMachineError) -> Self {
        BridgeError::StateTransitionError(format!("{err}"))
    }
}

impl From<PersistenceError> for BridgeError {
    fn from(err: PersistenceError) -> Self {
        BridgeError::PersistenceError(format!("{err}"))
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
