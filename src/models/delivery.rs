use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Why a delivery did or did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryReason {
    #[default]
    None,
    Error,
    FailedDelivery,
    TimedOut,
    OrchestrationTimeout,
}

impl DeliveryReason {
    /// Timeout-like reasons map to a 408 ack rather than a 500
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut | Self::OrchestrationTimeout)
    }
}

impl fmt::Display for DeliveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Error => write!(f, "ERROR"),
            Self::FailedDelivery => write!(f, "FAILED_DELIVERY"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
            Self::OrchestrationTimeout => write!(f, "ORCHESTRATION_TIMEOUT"),
        }
    }
}

impl std::str::FromStr for DeliveryReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" | "" => Ok(Self::None),
            "ERROR" => Ok(Self::Error),
            "FAILED_DELIVERY" => Ok(Self::FailedDelivery),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "ORCHESTRATION_TIMEOUT" => Ok(Self::OrchestrationTimeout),
            _ => Err(format!("Invalid delivery reason: {s}")),
        }
    }
}

/// Outcome of the delivery stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(default)]
    pub reason: DeliveryReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Network reference correlating a later response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<u64>,
}

impl DeliveryResult {
    pub fn delivered(delivered_at: DateTime<Utc>, reference_number: Option<u64>) -> Self {
        Self {
            success: true,
            reason: DeliveryReason::None,
            delivered_at: Some(delivered_at),
            reference_number,
        }
    }

    pub fn failed(reason: DeliveryReason, at: Option<DateTime<Utc>>) -> Self {
        Self {
            success: false,
            reason,
            delivered_at: at,
            reference_number: None,
        }
    }

    pub fn orchestration_timeout() -> Self {
        Self::failed(DeliveryReason::OrchestrationTimeout, None)
    }
}

/// A device reply matched to a waiting command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub mobile_id: String,
    pub codec_service_id: u8,
    pub codec_message_id: u8,
    #[serde(default)]
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_format() {
        let json = serde_json::to_string(&DeliveryReason::OrchestrationTimeout).unwrap();
        assert_eq!(json, "\"ORCHESTRATION_TIMEOUT\"");
        assert_eq!(
            "FAILED_DELIVERY".parse::<DeliveryReason>().unwrap(),
            DeliveryReason::FailedDelivery
        );
        assert!("BOGUS".parse::<DeliveryReason>().is_err());
    }

    #[test]
    fn test_timeout_reasons() {
        assert!(DeliveryReason::TimedOut.is_timeout());
        assert!(DeliveryReason::OrchestrationTimeout.is_timeout());
        assert!(!DeliveryReason::FailedDelivery.is_timeout());
        assert!(!DeliveryResult::orchestration_timeout().success);
    }
}
