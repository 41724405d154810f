//! Contracts for the external collaborators the orchestrator drives.

use crate::models::CommandRequest;
use async_trait::async_trait;
use thiserror::Error;

/// Failure talking to the satellite network's submission endpoint
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmissionError {
    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid command payload: {0}")]
    InvalidPayload(String),

    #[error("Submission client error: {0}")]
    Client(String),
}

impl From<SubmissionError> for crate::error::BridgeError {
    fn from(err: SubmissionError) -> Self {
        crate::error::BridgeError::SubmissionError(err.to_string())
    }
}

/// Satellite network client that accepts OTA commands.
///
/// `Ok(false)` means the network answered but refused the message.
/// Implementations are expected to echo the request's `command_id` back as the
/// `submission_id` of the later `CommandSending` event.
#[async_trait]
pub trait CommandSubmitter: Send + Sync {
    async fn submit_command(&self, request: &CommandRequest) -> Result<bool, SubmissionError>;
}
