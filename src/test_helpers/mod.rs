//! # Test Helpers
//!
//! In-memory stand-ins for the external collaborators, shared by unit and
//! integration tests.

pub mod in_memory_shadow;
pub mod recording_submitter;

pub use in_memory_shadow::InMemoryShadowClient;
pub use recording_submitter::{RecordingSubmitter, SubmitBehavior};

use crate::models::{CommandPayload, CommandRequest, CompletionSpec, PayloadField};
use uuid::Uuid;

pub const TEST_MOBILE_ID: &str = "01459438SKYFEE3";

/// The wakeup-period write used throughout the examples: 0/70, no response
pub fn wakeup_period_request(mobile_id: &str, command_version: Option<u64>) -> CommandRequest {
    CommandRequest {
        command_id: Uuid::new_v4(),
        mobile_id: mobile_id.to_string(),
        codec_service_id: 0,
        codec_message_id: 70,
        command_version,
        payload: CommandPayload::PayloadJson {
            fields: vec![PayloadField::new("wakeupPeriod", "0")],
        },
        completion: Some(CompletionSpec::for_property("wakeupPeriod")),
    }
}

/// A ping that expects the modem's 0/112 reply
pub fn ping_request(mobile_id: &str) -> CommandRequest {
    CommandRequest {
        command_id: Uuid::new_v4(),
        mobile_id: mobile_id.to_string(),
        codec_service_id: 0,
        codec_message_id: 112,
        command_version: None,
        payload: CommandPayload::ModemCommand {
            command: "ping".to_string(),
            params: None,
        },
        completion: Some(
            CompletionSpec::for_property("commandPingModem").with_expected_response(0, 112),
        ),
    }
}
