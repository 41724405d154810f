//! # Reconciliation Planning
//!
//! Pure diff of a device shadow into a reported-property patch and the OTA
//! commands needed to move the device toward its desired state. Nothing here
//! performs I/O; the reconciler dispatches the planned requests and writes the
//! patch.
//!
//! Per desired property, in order:
//!
//! 1. reported value equals desired at an ack version at least as new:
//!    satisfied. A pending ack is closed as presumed complete.
//! 2. pending at an ack version at least as new: the write is in flight. The
//!    instance id it runs under is recorded so a lost completion can be
//!    recovered from the orchestrator.
//! 3. already acknowledged (ok, rejected, error, timed out) at this version:
//!    settled, not retried until the desired version moves.
//! 4. otherwise translate through the device model and write.

use super::device_model::DeviceModel;
use crate::constants::ack_descriptions;
use crate::models::{
    AckStatus, CommandRequest, CompletionSpec, DesiredProperty, DeviceShadow, InstanceId,
    PropertyState, ShadowPatch,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome for one desired property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyDecision {
    Satisfied,
    PresumedClosed,
    InFlight,
    /// In flight per the shadow, but the command had already finished
    Recovered,
    Settled(AckStatus),
    Write,
    NotWritable(String),
    TranslationFailed(String),
    /// Translated, but the orchestrator refused the request
    DispatchFailed(String),
}

impl PropertyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::PresumedClosed => "presumed_closed",
            Self::InFlight => "in_flight",
            Self::Recovered => "recovered",
            Self::Settled(_) => "settled",
            Self::Write => "write",
            Self::NotWritable(_) => "not_writable",
            Self::TranslationFailed(_) => "translation_failed",
            Self::DispatchFailed(_) => "dispatch_failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub patch: ShadowPatch,
    pub requests: Vec<CommandRequest>,
    pub decisions: BTreeMap<String, PropertyDecision>,
    /// Instance each in-flight property is waiting on
    pub in_flight: BTreeMap<String, InstanceId>,
    /// First contact: the model baseline was emitted instead of a diff
    pub initialized: bool,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.patch.is_empty() && self.requests.is_empty()
    }
}

/// No reported history worth reconciling against
pub fn is_first_contact(shadow: &DeviceShadow) -> bool {
    shadow.reported_version <= 1 && !shadow.has_ack_history()
}

/// Decide what a single property needs, before any translation
pub fn classify(desired: &DesiredProperty, reported: Option<&PropertyState>) -> PropertyDecision {
    let Some(reported) = reported else {
        return PropertyDecision::Write;
    };
    let current = reported.version >= desired.version;

    if current && reported.value == desired.value {
        if reported.ack.is_pending() {
            return PropertyDecision::PresumedClosed;
        }
        return PropertyDecision::Satisfied;
    }
    if current && reported.ack.is_pending() {
        return PropertyDecision::InFlight;
    }
    if current {
        return PropertyDecision::Settled(reported.ack);
    }
    PropertyDecision::Write
}

pub fn plan_reconciliation(
    shadow: &DeviceShadow,
    model: &dyn DeviceModel,
    mobile_id: &str,
) -> ReconcilePlan {
    if is_first_contact(shadow) {
        return ReconcilePlan {
            patch: model.initialize(mobile_id),
            initialized: true,
            ..Default::default()
        };
    }

    let mut plan = ReconcilePlan::default();
    for (name, desired) in &shadow.desired {
        let reported = shadow.reported_state(name);
        // Value the device currently holds; a write does not change it until confirmed
        let held = reported
            .map(|state| state.value.clone())
            .or_else(|| shadow.reported.get(name).map(|r| r.value().clone()))
            .unwrap_or(Value::Null);

        let decision = match classify(desired, reported) {
            PropertyDecision::PresumedClosed => {
                plan.patch.set_state(
                    name.clone(),
                    PropertyState::new(
                        desired.value.clone(),
                        AckStatus::Ok,
                        ack_descriptions::PRESUMED_CLOSED,
                        desired.version,
                    ),
                );
                PropertyDecision::PresumedClosed
            }
            PropertyDecision::Write => write_property(&mut plan, model, mobile_id, name, desired, held),
            PropertyDecision::InFlight => {
                if let Some(version) = reported.map(|state| state.version) {
                    if let Ok(spec) = model.translate_write(name, &desired.value, version) {
                        plan.in_flight.insert(
                            name.clone(),
                            InstanceId::derive(
                                mobile_id,
                                spec.codec_service_id,
                                spec.codec_message_id,
                                Some(version),
                            ),
                        );
                    }
                }
                PropertyDecision::InFlight
            }
            other => other,
        };
        plan.decisions.insert(name.clone(), decision);
    }
    plan
}

fn write_property(
    plan: &mut ReconcilePlan,
    model: &dyn DeviceModel,
    mobile_id: &str,
    name: &str,
    desired: &DesiredProperty,
    held: Value,
) -> PropertyDecision {
    match model.translate_write(name, &desired.value, desired.version) {
        Ok(mut spec) => {
            let completion = spec
                .completion
                .take()
                .unwrap_or_else(|| CompletionSpec::for_property(name))
                .with_write(desired.value.clone(), desired.version);
            spec.completion = Some(completion);
            plan.requests.push(CommandRequest::from_spec(
                mobile_id,
                spec,
                Some(desired.version),
            ));
            plan.patch.set_state(
                name,
                PropertyState::new(
                    held,
                    AckStatus::Pending,
                    ack_descriptions::PENDING_OTA_WRITE,
                    desired.version,
                ),
            );
            PropertyDecision::Write
        }
        Err(error) => {
            let (ack, decision) = if error.is_not_writable() {
                (AckStatus::Rejected, PropertyDecision::NotWritable(error.to_string()))
            } else {
                (AckStatus::Error, PropertyDecision::TranslationFailed(error.to_string()))
            };
            plan.patch.set_state(
                name,
                PropertyState::new(held, ack, error.to_string(), desired.version),
            );
            decision
        }
    }
}
