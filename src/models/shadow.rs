//! # Device Shadow Model
//!
//! Desired vs. reported property state of a device twin. Writable properties
//! carry an ack triple (code, description, version) on the reported side; on the
//! wire it is encoded as `{"value", "ac", "ad", "av"}`.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Acknowledgement status of a writable property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckStatus {
    /// 200 - desired value applied
    Ok,
    /// 202 - OTA write in flight
    Pending,
    /// 400 - property not writable
    Rejected,
    /// 408 - command timed out
    TimedOut,
    /// 500 - command failed
    Error,
}

impl AckStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Pending => 202,
            Self::Rejected => 400,
            Self::TimedOut => 408,
            Self::Error => 500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Ok),
            202 => Some(Self::Pending),
            400 => Some(Self::Rejected),
            408 => Some(Self::TimedOut),
            500 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for AckStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

impl<'de> Deserialize<'de> for AckStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u16::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| D::Error::custom(format!("Invalid ack code: {code}")))
    }
}

/// Reported state of a writable property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyState {
    pub value: Value,
    #[serde(rename = "ac")]
    pub ack: AckStatus,
    #[serde(rename = "ad", default)]
    pub description: String,
    #[serde(rename = "av", default)]
    pub version: u64,
}

impl PropertyState {
    pub fn new(value: Value, ack: AckStatus, description: impl Into<String>, version: u64) -> Self {
        Self {
            value,
            ack,
            description: description.into(),
            version,
        }
    }
}

/// A reported entry is either an acked writable property or a plain value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportedValue {
    Acked(PropertyState),
    Plain(Value),
}

impl ReportedValue {
    pub fn value(&self) -> &Value {
        match self {
            Self::Acked(state) => &state.value,
            Self::Plain(value) => value,
        }
    }

    pub fn as_acked(&self) -> Option<&PropertyState> {
        match self {
            Self::Acked(state) => Some(state),
            Self::Plain(_) => None,
        }
    }
}

/// Desired value together with the desired-side version it was set at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredProperty {
    pub value: Value,
    pub version: u64,
}

/// Snapshot of a device twin, read fresh for every reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceShadow {
    pub desired: BTreeMap<String, DesiredProperty>,
    pub desired_version: u64,
    pub reported: BTreeMap<String, ReportedValue>,
    pub reported_version: u64,
}

impl DeviceShadow {
    /// Parse twin documents of the form `{"$version": n, "prop": value, ...}`.
    /// Every desired property takes the document's `$version`.
    pub fn from_twin(desired: &Value, reported: &Value) -> Result<Self, serde_json::Error> {
        let empty = Map::new();
        let desired_doc = desired.as_object().unwrap_or(&empty);
        let reported_doc = reported.as_object().unwrap_or(&empty);

        let desired_version = document_version(desired_doc);
        let reported_version = document_version(reported_doc);

        let desired = desired_doc
            .iter()
            .filter(|(name, _)| !name.starts_with('$'))
            .map(|(name, value)| {
                (
                    name.clone(),
                    DesiredProperty {
                        value: value.clone(),
                        version: desired_version,
                    },
                )
            })
            .collect();

        let reported = reported_doc
            .iter()
            .filter(|(name, _)| !name.starts_with('$'))
            .map(|(name, value)| Ok((name.clone(), serde_json::from_value(value.clone())?)))
            .collect::<Result<BTreeMap<_, _>, serde_json::Error>>()?;

        Ok(Self {
            desired,
            desired_version,
            reported,
            reported_version,
        })
    }

    pub fn reported_state(&self, name: &str) -> Option<&PropertyState> {
        self.reported.get(name).and_then(ReportedValue::as_acked)
    }

    /// True when no property has ever been acknowledged
    pub fn has_ack_history(&self) -> bool {
        self.reported
            .values()
            .any(|reported| reported.as_acked().is_some())
    }
}

fn document_version(doc: &Map<String, Value>) -> u64 {
    doc.get("$version").and_then(Value::as_u64).unwrap_or(0)
}

/// Reported-property update written back to the twin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShadowPatch {
    pub properties: BTreeMap<String, ReportedValue>,
}

impl ShadowPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&mut self, name: impl Into<String>, state: PropertyState) {
        self.properties.insert(name.into(), ReportedValue::Acked(state));
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), ReportedValue::Plain(value));
    }

    pub fn get_state(&self, name: &str) -> Option<&PropertyState> {
        self.properties.get(name).and_then(ReportedValue::as_acked)
    }

    /// Overlay `other` on top of this patch; entries in `other` win
    pub fn merge(&mut self, other: ShadowPatch) {
        self.properties.extend(other.properties);
    }

    /// Drop plain `null` entries, which the twin would interpret as deletes
    pub fn without_nulls(mut self) -> Self {
        self.properties
            .retain(|_, value| !matches!(value, ReportedValue::Plain(Value::Null)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }
}
