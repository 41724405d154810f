//! Built-in model for IsatData Pro modems without an application-specific
//! template.
//!
//! Two properties are real modem settings written through codec service 0.
//! The `command*` properties are proxy commands: setting one in the desired
//! shadow triggers a modem command, and the property returns to its idle value
//! once the command completes.

use super::device_model::{DeviceModel, DeviceModelError, DeviceModelResult};
use crate::constants::ack_descriptions;
use crate::models::{
    AckStatus, CommandPayload, CompletionSpec, OtaCommandSpec, PayloadField, PropertyState,
    ResponseMessage, ShadowPatch,
};
use serde_json::{json, Value};

pub const MODEL_NAME: &str = "idpDefault";

const MODEM_SERVICE_ID: u8 = 0;
const WAKEUP_PERIOD: &str = "wakeupPeriod";
const WAKEUP_PERIOD_MESSAGE_ID: u8 = 70;
const TX_MUTE: &str = "txMute";
const TX_MUTE_MESSAGE_ID: u8 = 71;

/// A shadow property that triggers a modem command
struct ProxyCommand {
    property: &'static str,
    modem_command: &'static str,
    response_message_id: u8,
    /// Whether the desired value is passed through as command parameters
    takes_params: bool,
}

const PROXY_COMMANDS: &[ProxyCommand] = &[
    ProxyCommand {
        property: "commandPingModem",
        modem_command: "ping",
        response_message_id: 112,
        takes_params: false,
    },
    ProxyCommand {
        property: "commandGetLocation",
        modem_command: "getLocation",
        response_message_id: 72,
        takes_params: false,
    },
    ProxyCommand {
        property: "commandReset",
        modem_command: "reset",
        response_message_id: 0,
        takes_params: true,
    },
    ProxyCommand {
        property: "commandGetBroadcastIds",
        modem_command: "getBroadcastIds",
        response_message_id: 115,
        takes_params: false,
    },
    ProxyCommand {
        property: "commandGetConfiguration",
        modem_command: "getConfiguration",
        response_message_id: 97,
        takes_params: false,
    },
];

impl ProxyCommand {
    fn find(name: &str) -> Option<&'static ProxyCommand> {
        PROXY_COMMANDS
            .iter()
            .find(|proxy| proxy.property == name || proxy.modem_command == name)
    }

    fn idle_value(&self) -> Value {
        if self.takes_params {
            json!("none")
        } else {
            json!(false)
        }
    }

    /// Modem commands have no codec message of their own; they are keyed by
    /// the codec ids of their reply so each proxy gets its own instance id.
    fn spec(&self, params: Option<String>) -> OtaCommandSpec {
        OtaCommandSpec {
            codec_service_id: MODEM_SERVICE_ID,
            codec_message_id: self.response_message_id,
            payload: CommandPayload::ModemCommand {
                command: self.modem_command.to_string(),
                params,
            },
            completion: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdpDefaultModel;

impl IdpDefaultModel {
    pub fn new() -> Self {
        Self
    }

    fn wakeup_period(value: &Value) -> DeviceModelResult<OtaCommandSpec> {
        let period = match value {
            Value::String(period) if !period.trim().is_empty() => period.trim().to_string(),
            Value::Number(number) => number.to_string(),
            other => {
                return Err(DeviceModelError::InvalidValue {
                    property: WAKEUP_PERIOD.to_string(),
                    reason: format!("expected a wakeup period name or code, got {other}"),
                })
            }
        };
        Ok(Self::modem_setting(
            WAKEUP_PERIOD_MESSAGE_ID,
            WAKEUP_PERIOD,
            period,
        ))
    }

    fn tx_mute(value: &Value) -> DeviceModelResult<OtaCommandSpec> {
        let muted = value.as_bool().ok_or_else(|| DeviceModelError::InvalidValue {
            property: TX_MUTE.to_string(),
            reason: format!("expected boolean, got {value}"),
        })?;
        Ok(Self::modem_setting(
            TX_MUTE_MESSAGE_ID,
            TX_MUTE,
            if muted { "True" } else { "False" },
        ))
    }

    fn modem_setting(message_id: u8, field: &str, value: impl Into<String>) -> OtaCommandSpec {
        OtaCommandSpec {
            codec_service_id: MODEM_SERVICE_ID,
            codec_message_id: message_id,
            payload: CommandPayload::PayloadJson {
                fields: vec![PayloadField::new(field, value)],
            },
            completion: None,
        }
    }

    fn proxy_params(proxy: &ProxyCommand, value: &Value) -> DeviceModelResult<Option<String>> {
        if *value == proxy.idle_value() || value.is_null() {
            return Err(DeviceModelError::InvalidValue {
                property: proxy.property.to_string(),
                reason: "idle value does not trigger a command".to_string(),
            });
        }
        if !proxy.takes_params {
            return Ok(None);
        }
        match value {
            Value::String(params) => Ok(Some(params.clone())),
            Value::Bool(true) => Ok(None),
            other => Ok(Some(other.to_string())),
        }
    }
}

/// Manufacturer inferred from the mobile id's vendor code
fn manufacturer(mobile_id: &str) -> Option<&'static str> {
    if mobile_id.contains("SKY") {
        Some("ORBCOMM")
    } else if mobile_id.contains("HON") {
        Some("Honeywell")
    } else {
        None
    }
}

impl DeviceModel for IdpDefaultModel {
    fn name(&self) -> &str {
        MODEL_NAME
    }

    fn initialize(&self, mobile_id: &str) -> ShadowPatch {
        let mut patch = ShadowPatch::new();
        patch.set_value("mobileId", json!(mobile_id));
        if let Some(manufacturer) = manufacturer(mobile_id) {
            patch.set_value("manufacturer", json!(manufacturer));
        }

        let default = |value: Value| {
            PropertyState::new(value, AckStatus::Ok, ack_descriptions::DEFAULT, 0)
        };
        patch.set_state(WAKEUP_PERIOD, default(json!("none")));
        patch.set_state(TX_MUTE, default(json!(false)));
        for proxy in PROXY_COMMANDS {
            patch.set_state(proxy.property, default(proxy.idle_value()));
        }
        patch
    }

    fn is_writable(&self, property: &str) -> bool {
        property == WAKEUP_PERIOD
            || property == TX_MUTE
            || PROXY_COMMANDS.iter().any(|proxy| proxy.property == property)
    }

    fn translate_write(
        &self,
        property: &str,
        value: &Value,
        _version: u64,
    ) -> DeviceModelResult<OtaCommandSpec> {
        match property {
            WAKEUP_PERIOD => Self::wakeup_period(value),
            TX_MUTE => Self::tx_mute(value),
            _ => {
                let proxy = PROXY_COMMANDS
                    .iter()
                    .find(|proxy| proxy.property == property)
                    .ok_or_else(|| DeviceModelError::NotWritable {
                        property: property.to_string(),
                    })?;
                let mut spec = proxy.spec(Self::proxy_params(proxy, value)?);
                spec.completion = Some(
                    CompletionSpec::for_property(proxy.property)
                        .with_expected_response(MODEM_SERVICE_ID, proxy.response_message_id)
                        .with_reset_value(proxy.idle_value()),
                );
                Ok(spec)
            }
        }
    }

    fn translate_command(&self, command: &str, data: &Value) -> DeviceModelResult<OtaCommandSpec> {
        match command {
            WAKEUP_PERIOD => Self::wakeup_period(data.get(WAKEUP_PERIOD).unwrap_or(data)),
            TX_MUTE => Self::tx_mute(data.get(TX_MUTE).unwrap_or(data)),
            _ => {
                let proxy =
                    ProxyCommand::find(command).ok_or_else(|| DeviceModelError::UnknownCommand {
                        command: command.to_string(),
                    })?;
                let params = if proxy.takes_params {
                    data.get("params")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                } else {
                    None
                };
                Ok(proxy.spec(params))
            }
        }
    }

    fn response_value(
        &self,
        completion: &CompletionSpec,
        response: &ResponseMessage,
    ) -> Option<Value> {
        if completion.property_name != WAKEUP_PERIOD {
            return None;
        }
        // The modem reports period names in mixed case
        response
            .payload
            .get(WAKEUP_PERIOD)
            .and_then(Value::as_str)
            .map(|period| json!(period.to_lowercase()))
    }
}
