//! # Orchestration Instance Model
//!
//! The durable record of one in-flight OTA command. Everything needed to resume
//! the command after a restart lives here: the current state, when the stage was
//! entered and when its wait expires, and the results accumulated so far.

use super::command::CommandRequest;
use super::delivery::{DeliveryResult, ResponseMessage};
use crate::constants::correlation::INVALID_MARKERS;
use crate::constants::INSTANCE_ID_PREFIX;
use crate::correlation::CorrelationKey;
use crate::events::types::CommandSending;
use crate::state_machine::CommandState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic identifier of an orchestration instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `otaCommand-{mobileId}-{codecServiceId}-{codecMessageId}[-{commandVersion}]`
    pub fn derive(
        mobile_id: &str,
        codec_service_id: u8,
        codec_message_id: u8,
        command_version: Option<u64>,
    ) -> Self {
        let mut id = format!("{INSTANCE_ID_PREFIX}-{mobile_id}-{codec_service_id}-{codec_message_id}");
        if let Some(version) = command_version {
            id.push_str(&format!("-{version}"));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id was derived from a missing or sentinel attribute
    pub fn is_malformed(&self) -> bool {
        self.0
            .split('-')
            .any(|part| INVALID_MARKERS.iter().any(|m| part.eq_ignore_ascii_case(m)))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Persisted state of one OTA command orchestration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationInstance {
    pub instance_id: InstanceId,
    pub state: CommandState,
    pub stage_started_at: DateTime<Utc>,
    /// Absolute deadline of the current stage's wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub command_request: CommandRequest,
    /// Set before the submission call so a restart never re-submits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_attempted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sending: Option<CommandSending>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<DeliveryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out_stage: Option<CommandState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub completion_emitted: bool,
}

impl OrchestrationInstance {
    pub fn new(command_request: CommandRequest, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: command_request.instance_id(),
            state: CommandState::Submitting,
            stage_started_at: now,
            stage_deadline: None,
            created_at: now,
            last_updated_at: now,
            command_request,
            submission_attempted_at: None,
            sending: None,
            delivered: None,
            response: None,
            timed_out_stage: None,
            failure_reason: None,
            completion_emitted: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn mobile_id(&self) -> &str {
        &self.command_request.mobile_id
    }

    /// Key the instance waits under in its current state
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        match self.state {
            CommandState::Submitting | CommandState::Sending => Some(CorrelationKey::submission(
                self.command_request.command_id,
            )),
            CommandState::Delivering => self
                .sending
                .as_ref()
                .map(|sending| CorrelationKey::delivery(sending.message_id)),
            CommandState::AwaitingResponse => {
                self.command_request
                    .expected_response()
                    .map(|(sin, min)| {
                        CorrelationKey::response(&self.command_request.mobile_id, sin, min)
                    })
            }
            CommandState::Completed | CommandState::Failed | CommandState::TimedOut => None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_updated_at
    }

    /// Malformed correlation: sentinel markers in the id or mobile id
    pub fn is_malformed(&self) -> bool {
        self.instance_id.is_malformed()
            || self
                .correlation_key()
                .is_some_and(|key| key.is_malformed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::command::CommandPayload;
    use uuid::Uuid;

    fn request(mobile_id: &str) -> CommandRequest {
        CommandRequest {
            command_id: Uuid::new_v4(),
            mobile_id: mobile_id.to_string(),
            codec_service_id: 0,
            codec_message_id: 72,
            command_version: None,
            payload: CommandPayload::ModemCommand {
                command: "getLocation".to_string(),
                params: None,
            },
            completion: None,
        }
    }

    #[test]
    fn test_new_instance_starts_submitting() {
        let now = Utc::now();
        let instance = OrchestrationInstance::new(request("01459438SKYFEE3"), now);
        assert_eq!(instance.state, CommandState::Submitting);
        assert_eq!(instance.created_at, now);
        assert!(!instance.is_terminal());
        assert!(!instance.completion_emitted);
        assert_eq!(
            instance.correlation_key(),
            Some(CorrelationKey::submission(instance.command_request.command_id))
        );
    }

    #[test]
    fn test_malformed_instance_detection() {
        let instance = OrchestrationInstance::new(request("undefined"), Utc::now());
        assert!(instance.is_malformed());

        let instance = OrchestrationInstance::new(request("01459438SKYFEE3"), Utc::now());
        assert!(!instance.is_malformed());
    }

    #[test]
    fn test_terminal_instance_has_no_key() {
        let mut instance = OrchestrationInstance::new(request("01459438SKYFEE3"), Utc::now());
        instance.state = CommandState::Completed;
        assert!(instance.correlation_key().is_none());
    }
}
