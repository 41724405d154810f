//! Inbound network events and outbound orchestration events.

use crate::constants::{events, forward_states};
use crate::models::{
    CommandRequest, CompletionSpec, DeliveryReason, DeliveryResult, InstanceId,
    OrchestrationInstance, ResponseMessage,
};
use crate::state_machine::CommandState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// The network picked up a submitted message and scheduled it for sending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSending {
    /// Command id echoed back by the submission client
    pub submission_id: Uuid,
    /// Network-assigned forward message id
    pub message_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_send_time_utc: Option<String>,
    /// Encoded message size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

/// Delivery outcome for a forward message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDelivered {
    pub message_id: u64,
    pub result: DeliveryResult,
}

/// Raw forward-message status change as polled from the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStateChange {
    pub message_id: u64,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<u64>,
}

impl ForwardStateChange {
    /// Convert a final state into a delivery event; intermediate states yield `None`
    pub fn into_delivered(self, now: DateTime<Utc>) -> Option<CommandDelivered> {
        let at = self.state_utc.unwrap_or(now);
        let state = self.state.as_str();

        let result = if forward_states::SUCCESS_STATES.contains(&state) {
            DeliveryResult::delivered(at, self.reference_number)
        } else if forward_states::FAILED_STATES.contains(&state) {
            let reason = state.parse().unwrap_or(DeliveryReason::Error);
            DeliveryResult::failed(reason, Some(at))
        } else {
            debug!(message_id = self.message_id, state = %self.state, "Ignoring non-final forward state");
            return None;
        };

        Some(CommandDelivered {
            message_id: self.message_id,
            result,
        })
    }
}

/// Events the bridge reacts to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum InboundEvent {
    CommandRequestReceived(CommandRequest),
    CommandSending(CommandSending),
    CommandDelivered(CommandDelivered),
    ResponseReceived(ResponseMessage),
    ForwardStateChange(ForwardStateChange),
}

impl InboundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CommandRequestReceived(_) => "commandRequestReceived",
            Self::CommandSending(_) => "commandSending",
            Self::CommandDelivered(_) => "commandDelivered",
            Self::ResponseReceived(_) => "responseReceived",
            Self::ForwardStateChange(_) => "forwardStateChange",
        }
    }
}

/// Observability record for each state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub instance_id: InstanceId,
    pub mobile_id: String,
    pub from_state: CommandState,
    pub to_state: CommandState,
    pub event: String,
    pub transitioned_at: DateTime<Utc>,
}

/// Terminal outcome of one command.
///
/// Published once per instance in normal operation, but delivery is at least
/// once: the event goes out before the instance records that it was sent, so a
/// crash in between re-emits it on resume. Consumers must tolerate repeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandComplete {
    pub command_id: Uuid,
    pub instance_id: InstanceId,
    pub mobile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionSpec>,
    pub delivered: DeliveryResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseMessage>,
    pub final_state: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out_stage: Option<CommandState>,
    pub completed_at: DateTime<Utc>,
}

impl CommandComplete {
    /// Outcome of a terminal instance. An instance that never recorded a
    /// delivery result reports an orchestration timeout.
    pub fn from_instance(instance: &OrchestrationInstance, completed_at: DateTime<Utc>) -> Self {
        let request = &instance.command_request;
        Self {
            command_id: request.command_id,
            instance_id: instance.instance_id.clone(),
            mobile_id: request.mobile_id.clone(),
            completion: request.completion.clone(),
            delivered: instance
                .delivered
                .clone()
                .unwrap_or_else(DeliveryResult::orchestration_timeout),
            response: instance.response.clone(),
            final_state: instance.state,
            timed_out_stage: instance.timed_out_stage,
            completed_at,
        }
    }

    /// Delivered, but the expected reply never arrived
    pub fn response_missing(&self) -> bool {
        self.delivered.success
            && self.response.is_none()
            && self.timed_out_stage == Some(CommandState::AwaitingResponse)
    }
}

/// Events published on the orchestration channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrchestrationEvent {
    StageTransition(StageTransition),
    CommandComplete(CommandComplete),
}

impl OrchestrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StageTransition(transition) => match transition.to_state {
                CommandState::Sending => events::COMMAND_SUBMITTED,
                CommandState::Delivering => events::COMMAND_SENDING,
                CommandState::AwaitingResponse => events::COMMAND_DELIVERED,
                CommandState::TimedOut => events::COMMAND_STAGE_TIMED_OUT,
                _ => events::COMMAND_STAGE_TRANSITION,
            },
            Self::CommandComplete(_) => events::COMMAND_COMPLETE,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::StageTransition(transition) => &transition.instance_id,
            Self::CommandComplete(complete) => &complete.instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_event_tagging() {
        let raw = json!({
            "eventType": "commandSending",
            "submissionId": "6f1c3f9e-8a51-4a35-9a8f-5d3f2b0c8c11",
            "messageId": 123,
            "scheduledSendTimeUtc": "2024-03-01 12:30:00",
            "size": 48
        });
        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        match event {
            InboundEvent::CommandSending(sending) => {
                assert_eq!(sending.message_id, 123);
                assert_eq!(sending.size, Some(48));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_forward_state_delivered() {
        let now = Utc::now();
        let change = ForwardStateChange {
            message_id: 77,
            state: "DELIVERED".to_string(),
            state_utc: None,
            reference_number: Some(9),
        };
        let delivered = change.into_delivered(now).unwrap();
        assert_eq!(delivered.message_id, 77);
        assert!(delivered.result.success);
        assert_eq!(delivered.result.delivered_at, Some(now));
        assert_eq!(delivered.result.reference_number, Some(9));
    }

    #[test]
    fn test_forward_state_failures_and_ignored_states() {
        let now = Utc::now();
        let failed = ForwardStateChange {
            message_id: 5,
            state: "FAILED_DELIVERY".to_string(),
            state_utc: None,
            reference_number: None,
        }
        .into_delivered(now)
        .unwrap();
        assert!(!failed.result.success);
        assert_eq!(failed.result.reason, DeliveryReason::FailedDelivery);

        let pending = ForwardStateChange {
            message_id: 5,
            state: "SUBMITTED".to_string(),
            state_utc: None,
            reference_number: None,
        };
        assert!(pending.into_delivered(now).is_none());
    }
}
