//! # Command Request Model
//!
//! An OTA command addressed to one satellite modem. Requests are immutable once
//! created; the orchestrator keeps an owned copy inside each instance.

use super::instance::InstanceId;
use crate::constants::correlation::INVALID_MARKERS;
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single named field of a codec-defined message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadField {
    pub name: String,
    pub string_value: String,
}

impl PayloadField {
    pub fn new(name: impl Into<String>, string_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            string_value: string_value.into(),
        }
    }
}

/// Wire-level content of an OTA command. Opaque to the orchestrator; only the
/// satellite network client interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandPayload {
    /// Codec-described message with named fields
    PayloadJson { fields: Vec<PayloadField> },
    /// Raw bytes, first two bytes being the codec service and message ids
    PayloadRaw(Vec<u8>),
    /// Modem-level command executed by the satellite gateway
    ModemCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<String>,
    },
}

/// Describes how a command completes and which shadow property it closes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSpec {
    pub property_name: String,
    /// Desired value being written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Desired property version the write belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response_codec_service_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response_codec_message_id: Option<u8>,
    /// Value the property returns to once the command has completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_value: Option<Value>,
}

impl CompletionSpec {
    pub fn for_property(property_name: impl Into<String>) -> Self {
        Self {
            property_name: property_name.into(),
            ..Default::default()
        }
    }

    pub fn with_write(mut self, value: Value, version: u64) -> Self {
        self.value = Some(value);
        self.version = Some(version);
        self
    }

    pub fn with_expected_response(mut self, codec_service_id: u8, codec_message_id: u8) -> Self {
        self.expected_response_codec_service_id = Some(codec_service_id);
        self.expected_response_codec_message_id = Some(codec_message_id);
        self
    }

    pub fn with_reset_value(mut self, reset_value: Value) -> Self {
        self.reset_value = Some(reset_value);
        self
    }

    /// Response codec ids, when the command expects a reply from the device
    pub fn expected_response(&self) -> Option<(u8, u8)> {
        match (
            self.expected_response_codec_service_id,
            self.expected_response_codec_message_id,
        ) {
            (Some(sin), Some(min)) => Some((sin, min)),
            (Some(sin), None) => Some((sin, 0)),
            _ => None,
        }
    }
}

/// Device-model translation of a property write or named command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaCommandSpec {
    pub codec_service_id: u8,
    pub codec_message_id: u8,
    pub payload: CommandPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionSpec>,
}

/// Request to deliver one OTA command to a mobile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command_id: Uuid,
    pub mobile_id: String,
    pub codec_service_id: u8,
    pub codec_message_id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_version: Option<u64>,
    pub payload: CommandPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionSpec>,
}

impl CommandRequest {
    /// Build a request from a device-model translation
    pub fn from_spec(
        mobile_id: impl Into<String>,
        spec: OtaCommandSpec,
        command_version: Option<u64>,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            mobile_id: mobile_id.into(),
            codec_service_id: spec.codec_service_id,
            codec_message_id: spec.codec_message_id,
            command_version,
            payload: spec.payload,
            completion: spec.completion,
        }
    }

    /// Deterministic orchestration instance id; duplicate requests collide
    pub fn instance_id(&self) -> InstanceId {
        InstanceId::derive(
            &self.mobile_id,
            self.codec_service_id,
            self.codec_message_id,
            self.command_version,
        )
    }

    /// Property this command closes, if any
    pub fn property_name(&self) -> Option<&str> {
        self.completion.as_ref().map(|c| c.property_name.as_str())
    }

    pub fn expected_response(&self) -> Option<(u8, u8)> {
        self.completion
            .as_ref()
            .and_then(CompletionSpec::expected_response)
    }

    /// Reject requests whose correlation attributes would be malformed
    pub fn validate(&self) -> BridgeResult<()> {
        let mobile_id = self.mobile_id.trim();
        if INVALID_MARKERS
            .iter()
            .any(|marker| mobile_id.eq_ignore_ascii_case(marker))
        {
            return Err(BridgeError::ValidationError(format!(
                "Command {} has invalid mobileId '{}'",
                self.command_id, self.mobile_id
            )));
        }
        if let CommandPayload::PayloadRaw(bytes) = &self.payload {
            if bytes.len() < 2 {
                return Err(BridgeError::ValidationError(format!(
                    "Command {} raw payload shorter than codec header",
                    self.command_id
                )));
            }
        }
        Ok(())
    }
}
