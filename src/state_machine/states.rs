use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of an OTA command orchestration instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Instance created, submission to the network in progress
    #[default]
    Submitting,
    /// Submitted, waiting for the network to start sending
    Sending,
    /// Sending, waiting for a delivery outcome
    Delivering,
    /// Delivered, waiting for the device's reply
    AwaitingResponse,
    /// Command reached a definite outcome (delivered, with reply if expected)
    Completed,
    /// Submission or delivery failed
    Failed,
    /// A stage wait expired
    TimedOut,
}

impl CommandState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Check if the instance is parked waiting on an external event
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::Sending | Self::Delivering | Self::AwaitingResponse
        )
    }

    /// Position along the lifecycle; transitions only ever increase it
    pub fn rank(&self) -> u8 {
        match self {
            Self::Submitting => 0,
            Self::Sending => 1,
            Self::Delivering => 2,
            Self::AwaitingResponse => 3,
            Self::Completed | Self::Failed | Self::TimedOut => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitting => "submitting",
            Self::Sending => "sending",
            Self::Delivering => "delivering",
            Self::AwaitingResponse => "awaiting_response",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CommandState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitting" => Ok(Self::Submitting),
            "sending" => Ok(Self::Sending),
            "delivering" => Ok(Self::Delivering),
            "awaiting_response" => Ok(Self::AwaitingResponse),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid command state: {s}")),
        }
    }
}
