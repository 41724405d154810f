//! # Shadow Reconciler
//!
//! Runs reconciliation passes against the device-management plane and closes
//! the loop when commands complete.
//!
//! A pass reads the shadow fresh, plans the diff, dispatches the planned
//! commands through the orchestrator and writes one patch. Properties still
//! pending on a command that has already finished are closed from the stored
//! outcome, so a completion the listener missed does not leave them stuck. Passes for the same
//! device are serialized through a per-device lock; different devices run
//! concurrently. Completion handling takes the same lock, so a completion never
//! interleaves with a pass on its device.

use super::clients::ShadowClient;
use super::device_model::DeviceModel;
use super::device_registry::{DeviceContext, DeviceRegistry};
use super::plan::{plan_reconciliation, PropertyDecision, ReconcilePlan};
use crate::constants::ack_descriptions;
use crate::error::BridgeResult;
use crate::events::{CommandComplete, OrchestrationEvent};
use crate::logging::{log_error, log_reconcile_operation};
use crate::models::{
    AckStatus, CommandRequest, CompletionSpec, DeviceShadow, InstanceId, PropertyState,
    ReportedValue, ShadowPatch,
};
use crate::orchestration::{CommandDispatcher, StartOutcome};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub device_id: String,
    /// Patch written to the shadow, after merging and dropping nulls
    pub patch: ShadowPatch,
    pub dispatched: Vec<InstanceId>,
    /// Planned writes whose instance was already in flight
    pub already_active: Vec<InstanceId>,
    pub decisions: BTreeMap<String, PropertyDecision>,
    pub initialized: bool,
}

impl ReconcileReport {
    pub fn patch_written(&self) -> bool {
        !self.patch.is_empty()
    }
}

pub struct ShadowReconciler {
    shadows: Arc<dyn ShadowClient>,
    dispatcher: Arc<dyn CommandDispatcher>,
    registry: Arc<DeviceRegistry>,
    device_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ShadowReconciler {
    pub fn new(
        shadows: Arc<dyn ShadowClient>,
        dispatcher: Arc<dyn CommandDispatcher>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            shadows,
            dispatcher,
            registry,
            device_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Pass for a mobile, registering it under the default model if unknown
    pub async fn run_pass_for_mobile(
        &self,
        mobile_id: &str,
        incoming: Option<ShadowPatch>,
    ) -> BridgeResult<ReconcileReport> {
        let device = self.registry.device_or_default(mobile_id)?;
        self.run_pass(&device, incoming).await
    }

    /// One reconciliation pass. `incoming` carries reported properties parsed
    /// from a return message; planned entries win over it.
    ///
    /// A shadow read failure aborts the pass without writing anything.
    pub async fn run_pass(
        &self,
        device: &DeviceContext,
        incoming: Option<ShadowPatch>,
    ) -> BridgeResult<ReconcileReport> {
        let lock = self.device_lock(&device.device_id);
        let _guard = lock.lock().await;

        let model = self.registry.model_for(device)?;
        let shadow = self
            .shadows
            .read_device_shadow(&device.device_id)
            .await
            .inspect_err(|error| {
                log_error(
                    "shadow_reconciler",
                    "read_device_shadow",
                    &error.to_string(),
                    Some(&device.device_id),
                )
            })?;

        let mut plan = plan_reconciliation(&shadow, model.as_ref(), &device.mobile_id);
        self.recover_finished(&device.device_id, model.as_ref(), &shadow, &mut plan)
            .await;
        let mut report = ReconcileReport {
            device_id: device.device_id.clone(),
            initialized: plan.initialized,
            ..Default::default()
        };
        if plan.initialized {
            info!(device_id = %device.device_id, model = model.name(), "Initializing device shadow");
        } else if plan.is_noop() {
            debug!(device_id = %device.device_id, "Shadow converged, nothing to dispatch");
        }

        for request in std::mem::take(&mut plan.requests) {
            let property = request.property_name().unwrap_or_default().to_string();
            match self.dispatch(request).await {
                Ok(StartOutcome::Started { instance_id }) => {
                    log_reconcile_operation(
                        "dispatch",
                        &device.device_id,
                        Some(&property),
                        "started",
                        Some(instance_id.as_str()),
                    );
                    report.dispatched.push(instance_id);
                }
                Ok(StartOutcome::AlreadyActive { instance_id, state }) => {
                    debug!(
                        device_id = %device.device_id,
                        property = %property,
                        instance_id = %instance_id,
                        state = %state,
                        "Write already in flight"
                    );
                    report.already_active.push(instance_id);
                }
                Err(error) => {
                    log_reconcile_operation(
                        "dispatch",
                        &device.device_id,
                        Some(&property),
                        "failed",
                        Some(&error.to_string()),
                    );
                    if let Some(pending) = plan.patch.get_state(&property).cloned() {
                        plan.patch.set_state(
                            property.clone(),
                            PropertyState::new(
                                pending.value,
                                AckStatus::Error,
                                error.to_string(),
                                pending.version,
                            ),
                        );
                    }
                    plan.decisions
                        .insert(property, PropertyDecision::DispatchFailed(error.to_string()));
                }
            }
        }

        let patch = match incoming {
            Some(incoming) => merge_reported(&shadow, incoming, plan.patch),
            None => plan.patch,
        }
        .without_nulls();

        if !patch.is_empty() {
            self.shadows
                .write_shadow_patch(&device.device_id, &patch)
                .await?;
        }

        for (property, decision) in &plan.decisions {
            log_reconcile_operation(
                "reconcile",
                &device.device_id,
                Some(property),
                decision.as_str(),
                None,
            );
        }

        report.patch = patch;
        report.decisions = plan.decisions;
        Ok(report)
    }

    async fn dispatch(&self, request: CommandRequest) -> BridgeResult<StartOutcome> {
        self.dispatcher.dispatch(request).await
    }

    /// Close in-flight properties whose command already finished
    async fn recover_finished(
        &self,
        device_id: &str,
        model: &dyn DeviceModel,
        shadow: &DeviceShadow,
        plan: &mut ReconcilePlan,
    ) {
        for (property, instance_id) in std::mem::take(&mut plan.in_flight) {
            let complete = match self.dispatcher.finished(&instance_id).await {
                Ok(Some(complete)) => complete,
                Ok(None) => continue,
                Err(error) => {
                    log_error(
                        "shadow_reconciler",
                        "recover_finished",
                        &error.to_string(),
                        Some(instance_id.as_str()),
                    );
                    continue;
                }
            };
            let current = shadow.reported_state(&property);
            let Some(completion) = complete
                .completion
                .as_ref()
                .filter(|completion| completion.property_name == property)
            else {
                continue;
            };
            let Some(version) = current
                .map(|state| state.version)
                .filter(|version| completion.version == Some(*version))
            else {
                continue;
            };

            let state = completion_state(model, &complete, completion, current, version);
            log_reconcile_operation(
                "recover",
                device_id,
                Some(&property),
                &state.ack.to_string(),
                Some(instance_id.as_str()),
            );
            plan.patch.set_state(property.clone(), state);
            plan.decisions.insert(property, PropertyDecision::Recovered);
        }
    }

    /// Apply a command completion to the property it wrote.
    ///
    /// Returns the patch written, or `None` when the command closes no
    /// property, the completion is older than the property's ack version, or
    /// the property was already closed at this version. Completions may
    /// arrive more than once; repeats are no-ops.
    pub async fn handle_completion(
        &self,
        complete: &CommandComplete,
    ) -> BridgeResult<Option<ShadowPatch>> {
        let Some(completion) = complete.completion.as_ref() else {
            debug!(command_id = %complete.command_id, "Completion closes no property");
            return Ok(None);
        };

        let device = self.registry.device_or_default(&complete.mobile_id)?;
        let lock = self.device_lock(&device.device_id);
        let _guard = lock.lock().await;

        let model = self.registry.model_for(&device)?;
        let shadow = self.shadows.read_device_shadow(&device.device_id).await?;
        let property = completion.property_name.as_str();
        let current = shadow.reported_state(property);
        let version = completion
            .version
            .or(current.map(|state| state.version))
            .unwrap_or_default();

        if let Some(current) = current {
            if current.version > version {
                log_reconcile_operation(
                    "complete",
                    &device.device_id,
                    Some(property),
                    "stale",
                    Some(&format!(
                        "completion version {version} older than ack version {}",
                        current.version
                    )),
                );
                return Ok(None);
            }
            if current.version == version && !current.ack.is_pending() {
                log_reconcile_operation(
                    "complete",
                    &device.device_id,
                    Some(property),
                    "already_closed",
                    Some(complete.instance_id.as_str()),
                );
                return Ok(None);
            }
        }

        let state = completion_state(model.as_ref(), complete, completion, current, version);
        let status = state.ack.to_string();
        let mut patch = ShadowPatch::new();
        patch.set_state(property, state);
        self.shadows
            .write_shadow_patch(&device.device_id, &patch)
            .await?;

        log_reconcile_operation(
            "complete",
            &device.device_id,
            Some(property),
            &status,
            Some(complete.instance_id.as_str()),
        );
        Ok(Some(patch))
    }

    /// Dispatch an offline command through the orchestrator without touching
    /// the shadow
    pub async fn dispatch_command(
        &self,
        mobile_id: &str,
        command: &str,
        data: &Value,
    ) -> BridgeResult<StartOutcome> {
        let device = self.registry.device_or_default(mobile_id)?;
        let model = self.registry.model_for(&device)?;
        let spec = model.translate_command(command, data)?;
        let outcome = self
            .dispatch(CommandRequest::from_spec(mobile_id, spec, None))
            .await?;

        log_reconcile_operation(
            "dispatch_command",
            &device.device_id,
            Some(command),
            if outcome.is_started() {
                "started"
            } else {
                "already_active"
            },
            Some(outcome.instance_id().as_str()),
        );
        Ok(outcome)
    }

    /// Apply every `CommandComplete` on the orchestration channel until
    /// `shutdown` flips to true or the channel closes.
    pub fn spawn_completion_listener(
        self: Arc<Self>,
        mut events: broadcast::Receiver<OrchestrationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(OrchestrationEvent::CommandComplete(complete)) => {
                            let reconciler = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(error) = reconciler.handle_completion(&complete).await {
                                    log_error(
                                        "shadow_reconciler",
                                        "handle_completion",
                                        &error.to_string(),
                                        Some(complete.instance_id.as_str()),
                                    );
                                }
                            });
                        }
                        Ok(OrchestrationEvent::StageTransition(_)) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Completion listener lagged; completions were dropped");
                        }
                        Err(RecvError::Closed) => return,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Completion listener stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Ack state a finished command leaves on its property
fn completion_state(
    model: &dyn DeviceModel,
    complete: &CommandComplete,
    completion: &CompletionSpec,
    current: Option<&PropertyState>,
    version: u64,
) -> PropertyState {
    let held = current
        .map(|state| state.value.clone())
        .unwrap_or(Value::Null);

    if complete.delivered.success {
        let read_back = complete
            .response
            .as_ref()
            .and_then(|response| model.response_value(completion, response));
        let value = completion
            .reset_value
            .clone()
            .or(read_back)
            .or_else(|| completion.value.clone())
            .unwrap_or(held);
        let description = if complete.response_missing() {
            ack_descriptions::RESPONSE_MISSING
        } else {
            ack_descriptions::COMPLETED
        };
        return PropertyState::new(value, AckStatus::Ok, description, version);
    }

    let ack = if complete.delivered.reason.is_timeout() {
        AckStatus::TimedOut
    } else {
        AckStatus::Error
    };
    let value = completion.reset_value.clone().unwrap_or(held);
    PropertyState::new(value, ack, complete.delivered.reason.to_string(), version)
}

/// Overlay planned entries on incoming reported properties. A plain incoming
/// value for an acked property keeps the ack and only updates the value.
fn merge_reported(shadow: &DeviceShadow, incoming: ShadowPatch, planned: ShadowPatch) -> ShadowPatch {
    let mut merged = ShadowPatch::new();
    for (name, value) in incoming.properties {
        let value = match (value, shadow.reported_state(&name)) {
            (ReportedValue::Plain(value), Some(state)) if !value.is_null() => {
                ReportedValue::Acked(PropertyState {
                    value,
                    ..state.clone()
                })
            }
            (value, _) => value,
        };
        merged.properties.insert(name, value);
    }
    merged.merge(planned);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CommandComplete;
    use crate::models::{DeliveryReason, DeliveryResult, ResponseMessage};
    use crate::reconciler::IdpDefaultModel;
    use crate::state_machine::CommandState;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn complete(
        completion: CompletionSpec,
        delivered: DeliveryResult,
        response: Option<ResponseMessage>,
        timed_out_stage: Option<CommandState>,
    ) -> CommandComplete {
        CommandComplete {
            command_id: Uuid::new_v4(),
            instance_id: InstanceId::from("otaCommand-01459438SKYFEE3-0-70-6"),
            mobile_id: "01459438SKYFEE3".to_string(),
            completion: Some(completion),
            final_state: if delivered.success {
                CommandState::Completed
            } else {
                CommandState::Failed
            },
            delivered,
            response,
            timed_out_stage,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_completion_state_success_uses_written_value() {
        let completion = CompletionSpec::for_property("wakeupPeriod").with_write(json!("seconds30"), 6);
        let done = complete(
            completion.clone(),
            DeliveryResult::delivered(Utc::now(), None),
            None,
            None,
        );
        let state = completion_state(&IdpDefaultModel, &done, &completion, None, 6);
        assert_eq!(state.ack, AckStatus::Ok);
        assert_eq!(state.value, json!("seconds30"));
        assert_eq!(state.description, ack_descriptions::COMPLETED);
        assert_eq!(state.version, 6);
    }

    #[test]
    fn test_completion_state_failure_codes() {
        let completion = CompletionSpec::for_property("txMute").with_write(json!(true), 3);
        let held = PropertyState::new(json!(false), AckStatus::Pending, "", 3);

        let timed_out = complete(
            completion.clone(),
            DeliveryResult::orchestration_timeout(),
            None,
            Some(CommandState::Delivering),
        );
        let state = completion_state(&IdpDefaultModel, &timed_out, &completion, Some(&held), 3);
        assert_eq!(state.ack, AckStatus::TimedOut);
        assert_eq!(state.description, "ORCHESTRATION_TIMEOUT");
        assert_eq!(state.value, json!(false));

        let failed = complete(
            completion.clone(),
            DeliveryResult::failed(DeliveryReason::FailedDelivery, None),
            None,
            None,
        );
        let state = completion_state(&IdpDefaultModel, &failed, &completion, Some(&held), 3);
        assert_eq!(state.ack, AckStatus::Error);
        assert_eq!(state.description, "FAILED_DELIVERY");
    }

    #[test]
    fn test_proxy_resets_to_idle() {
        let completion = CompletionSpec::for_property("commandPingModem")
            .with_expected_response(0, 112)
            .with_reset_value(json!(false))
            .with_write(json!(true), 4);
        let response = ResponseMessage {
            mobile_id: "01459438SKYFEE3".to_string(),
            codec_service_id: 0,
            codec_message_id: 112,
            payload: json!({}),
            received_at: Utc::now(),
        };
        let done = complete(
            completion.clone(),
            DeliveryResult::delivered(Utc::now(), None),
            Some(response),
            None,
        );
        let state = completion_state(&IdpDefaultModel, &done, &completion, None, 4);
        assert_eq!(state.value, json!(false));
        assert_eq!(state.ack, AckStatus::Ok);
    }

    #[test]
    fn test_merge_reported_keeps_ack() {
        let shadow = DeviceShadow::from_twin(
            &json!({"$version": 2}),
            &json!({"$version": 5, "wakeupPeriod": {"value": "none", "ac": 200, "ad": "default", "av": 0}}),
        )
        .unwrap();
        let mut incoming = ShadowPatch::new();
        incoming.set_value("wakeupPeriod", json!("seconds30"));
        incoming.set_value("lastRxMsgTime", json!("2024-03-01T10:00:00Z"));

        let merged = merge_reported(&shadow, incoming, ShadowPatch::new());
        let wakeup = merged.get_state("wakeupPeriod").unwrap();
        assert_eq!(wakeup.value, json!("seconds30"));
        assert_eq!(wakeup.ack, AckStatus::Ok);
        assert_eq!(
            merged.properties["lastRxMsgTime"],
            ReportedValue::Plain(json!("2024-03-01T10:00:00Z"))
        );
    }
}
