use thiserror::Error;

/// Error types for command state machine operations
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: Option<String>, to: String },

    #[error("Action execution failed: {reason}")]
    ActionFailed { reason: String },

    #[error("Persistence operation failed: {reason}")]
    PersistenceFailed { reason: String },

    #[error("Instance {instance_id} was superseded by a newer command")]
    Superseded { instance_id: String },

    #[error("Instance {instance_id} already finished as {state}")]
    AlreadyTerminal { instance_id: String, state: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error type for instance store operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to save instance {instance_id}: {reason}")]
    SaveFailed { instance_id: String, reason: String },

    #[error("Instance {instance_id} was superseded by a newer command")]
    Superseded { instance_id: String },

    #[error("Instance {instance_id} already finished as {state}")]
    AlreadyTerminal { instance_id: String, state: String },

    #[error("Invalid stored instance data: {field}")]
    InvalidData { field: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PersistenceError> for StateMachineError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Superseded { instance_id } => Self::Superseded { instance_id },
            PersistenceError::AlreadyTerminal { instance_id, state } => {
                Self::AlreadyTerminal { instance_id, state }
            }
            other => Self::PersistenceFailed {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;

