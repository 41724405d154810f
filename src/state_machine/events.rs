use crate::events::types::CommandSending;
use crate::models::{DeliveryReason, DeliveryResult, ResponseMessage};
use serde::{Deserialize, Serialize};

/// Events that drive command state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CommandEvent {
    /// Network accepted the submission
    Submitted,
    /// Network rejected the submission synchronously
    SubmissionFailed(String),
    /// Network started sending the message
    Sending(CommandSending),
    /// Network reported a delivery outcome
    Delivered(DeliveryResult),
    /// Device replied with the expected message
    ResponseReceived(ResponseMessage),
    /// The current stage's wait expired
    StageTimedOut,
    /// Forced termination by garbage collection
    Terminate { reason: DeliveryReason },
}

impl CommandEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::SubmissionFailed(_) => "submission_failed",
            Self::Sending(_) => "sending",
            Self::Delivered(_) => "delivered",
            Self::ResponseReceived(_) => "response_received",
            Self::StageTimedOut => "stage_timed_out",
            Self::Terminate { .. } => "terminate",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::SubmissionFailed(msg) => Some(msg),
            _ => None,
        }
    }
}
