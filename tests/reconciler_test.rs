//! Shadow Reconciler Integration Tests
//!
//! Reconciliation passes against the in-memory twin store, dispatching through
//! a real orchestrator, plus the completion listener closing the loop.

use async_trait::async_trait;
use chrono::Utc;
use satcom_bridge::config::{BridgeConfig, ReconcilerConfig};
use satcom_bridge::constants::ack_descriptions;
use satcom_bridge::events::{
    CommandComplete, CommandDelivered, CommandSending, EventPublisher, InboundEvent,
    OrchestrationEvent,
};
use satcom_bridge::models::{
    AckStatus, CommandPayload, CommandRequest, CompletionSpec, DeliveryResult, DeviceShadow,
    InstanceId, PropertyState,
};
use satcom_bridge::orchestration::{CommandDispatcher, CommandOrchestrator, StartOutcome};
use satcom_bridge::reconciler::{DeviceRegistry, PropertyDecision, ShadowReconciler};
use satcom_bridge::state_machine::{CommandState, InMemoryInstanceStore};
use satcom_bridge::test_helpers::{InMemoryShadowClient, RecordingSubmitter, TEST_MOBILE_ID};
use satcom_bridge::{BridgeError, BridgeResult};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const DEVICE_ID: &str = "idp-01459438SKYFEE3";

struct Bridge {
    orchestrator: CommandOrchestrator,
    reconciler: Arc<ShadowReconciler>,
    shadows: Arc<InMemoryShadowClient>,
    submitter: Arc<RecordingSubmitter>,
}

fn bridge() -> Bridge {
    let shadows = Arc::new(InMemoryShadowClient::new());
    let submitter = Arc::new(RecordingSubmitter::new());
    let orchestrator = CommandOrchestrator::from_config(
        &BridgeConfig::default(),
        Arc::new(InMemoryInstanceStore::new()),
        submitter.clone(),
        EventPublisher::new(256),
    );
    let reconciler = Arc::new(ShadowReconciler::new(
        shadows.clone(),
        Arc::new(orchestrator.clone()),
        Arc::new(DeviceRegistry::new(ReconcilerConfig::default())),
    ));
    Bridge {
        orchestrator,
        reconciler,
        shadows,
        submitter,
    }
}

/// Twin with an acknowledged history so the pass diffs instead of initializing
fn seeded_shadow(desired: Value, reported: Value) -> DeviceShadow {
    DeviceShadow::from_twin(&desired, &reported).unwrap()
}

fn reported(shadows: &InMemoryShadowClient, property: &str) -> PropertyState {
    shadows
        .shadow(DEVICE_ID)
        .and_then(|shadow| shadow.reported_state(property).cloned())
        .unwrap_or_else(|| panic!("{property} has no acked state"))
}

async fn wait_for_submissions(submitter: &RecordingSubmitter, count: usize) -> Vec<CommandRequest> {
    for _ in 0..500 {
        if submitter.submission_count() >= count {
            return submitter.submitted();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("expected {count} submissions");
}

async fn wait_for_ack(
    shadows: &InMemoryShadowClient,
    property: &str,
    ack: AckStatus,
) -> PropertyState {
    for _ in 0..500 {
        let state = shadows
            .shadow(DEVICE_ID)
            .and_then(|shadow| shadow.reported_state(property).cloned());
        if let Some(state) = state.filter(|state| state.ack == ack) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("{property} never reached ack {ack}");
}

async fn wait_for_state(orchestrator: &CommandOrchestrator, instance_id: &InstanceId, state: CommandState) {
    for _ in 0..500 {
        if let Some(instance) = orchestrator.instance(instance_id).await.unwrap() {
            if instance.state == state {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("{instance_id} never reached {state}");
}

async fn next_completion(events: &mut broadcast::Receiver<OrchestrationEvent>) -> CommandComplete {
    loop {
        if let OrchestrationEvent::CommandComplete(complete) = events.recv().await.unwrap() {
            return complete;
        }
    }
}

struct RefusingDispatcher;

#[async_trait]
impl CommandDispatcher for RefusingDispatcher {
    async fn dispatch(&self, request: CommandRequest) -> BridgeResult<StartOutcome> {
        Err(BridgeError::OrchestrationError(format!(
            "refused {}",
            request.command_id
        )))
    }

    async fn finished(&self, _instance_id: &InstanceId) -> BridgeResult<Option<CommandComplete>> {
        Ok(None)
    }
}

/// Walk a submitted write through sending and a successful delivery
async fn deliver(b: &Bridge, instance_id: &InstanceId, request: &CommandRequest, message_id: u64) {
    wait_for_state(&b.orchestrator, instance_id, CommandState::Sending).await;
    b.orchestrator
        .handle_inbound(InboundEvent::CommandSending(CommandSending {
            submission_id: request.command_id,
            message_id,
            scheduled_send_time_utc: None,
            size: Some(12),
        }))
        .await
        .unwrap();
    wait_for_state(&b.orchestrator, instance_id, CommandState::Delivering).await;
    b.orchestrator
        .handle_inbound(InboundEvent::CommandDelivered(CommandDelivered {
            message_id,
            result: DeliveryResult::delivered(Utc::now(), None),
        }))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_first_contact_initializes_without_dispatch() {
    let b = bridge();
    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();

    assert!(report.initialized);
    assert!(report.dispatched.is_empty());
    assert!(report.patch_written());
    assert_eq!(report.device_id, DEVICE_ID);

    let shadow = b.shadows.shadow(DEVICE_ID).unwrap();
    assert_eq!(shadow.reported["manufacturer"].value(), &json!("ORBCOMM"));
    assert_eq!(shadow.reported["mobileId"].value(), &json!(TEST_MOBILE_ID));
    assert_eq!(reported(&b.shadows, "txMute").ack, AckStatus::Ok);

    // Once the baseline is in, the next pass diffs
    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert!(!report.initialized);
}

#[tokio::test(start_paused = true)]
async fn test_newer_desired_version_dispatches_write() {
    let b = bridge();
    b.shadows.insert(
        DEVICE_ID,
        seeded_shadow(
            json!({"$version": 6, "wakeupPeriod": "minutes5"}),
            json!({
                "$version": 9,
                "wakeupPeriod": {"value": "seconds30", "ac": 200, "ad": "completed", "av": 5}
            }),
        ),
    );

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.decisions["wakeupPeriod"], PropertyDecision::Write);

    let pending = report.patch.get_state("wakeupPeriod").unwrap();
    assert_eq!(pending.ack, AckStatus::Pending);
    assert_eq!(pending.version, 6);
    assert_eq!(pending.value, json!("seconds30"));
    assert_eq!(pending.description, ack_descriptions::PENDING_OTA_WRITE);

    let submitted = wait_for_submissions(&b.submitter, 1).await;
    assert_eq!(submitted[0].command_version, Some(6));
    assert_eq!(submitted[0].codec_message_id, 70);
    let completion = submitted[0].completion.as_ref().unwrap();
    assert_eq!(completion.value, Some(json!("minutes5")));
    assert_eq!(completion.version, Some(6));
}

#[tokio::test(start_paused = true)]
async fn test_acked_at_current_version_is_not_retried() {
    let b = bridge();
    b.shadows.insert(
        DEVICE_ID,
        seeded_shadow(
            json!({"$version": 6, "wakeupPeriod": "minutes5", "txMute": true}),
            json!({
                "$version": 9,
                "wakeupPeriod": {"value": "seconds30", "ac": 408, "ad": "orchestrationTimeout", "av": 6},
                "txMute": {"value": true, "ac": 200, "ad": "completed", "av": 6}
            }),
        ),
    );

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert!(!report.patch_written());
    assert_eq!(
        report.decisions["wakeupPeriod"],
        PropertyDecision::Settled(AckStatus::TimedOut)
    );
    assert_eq!(report.decisions["txMute"], PropertyDecision::Satisfied);
    assert_eq!(b.shadows.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_pass_is_idempotent() {
    let b = bridge();
    b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    b.shadows.set_desired(DEVICE_ID, "wakeupPeriod", json!("seconds30"));

    let first = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(first.dispatched.len(), 1);
    let writes = b.shadows.write_count();

    let second = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert!(second.dispatched.is_empty());
    assert!(second.already_active.is_empty());
    assert_eq!(second.decisions["wakeupPeriod"], PropertyDecision::InFlight);
    assert_eq!(b.shadows.write_count(), writes);

    wait_for_submissions(&b.submitter, 1).await;
    assert_eq!(b.submitter.submission_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bad_property_does_not_block_others() {
    let b = bridge();
    b.shadows.insert(
        DEVICE_ID,
        seeded_shadow(
            json!({
                "$version": 4,
                "txMute": "maybe",
                "manufacturer": "ACME",
                "wakeupPeriod": "seconds30"
            }),
            json!({
                "$version": 3,
                "txMute": {"value": false, "ac": 200, "ad": "default", "av": 0},
                "manufacturer": "ORBCOMM"
            }),
        ),
    );

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert!(matches!(
        report.decisions["txMute"],
        PropertyDecision::TranslationFailed(_)
    ));
    assert!(matches!(
        report.decisions["manufacturer"],
        PropertyDecision::NotWritable(_)
    ));
    assert_eq!(report.decisions["wakeupPeriod"], PropertyDecision::Write);

    assert_eq!(reported(&b.shadows, "txMute").ack, AckStatus::Error);
    assert_eq!(reported(&b.shadows, "txMute").value, json!(false));
    assert_eq!(reported(&b.shadows, "manufacturer").ack, AckStatus::Rejected);
    assert_eq!(reported(&b.shadows, "wakeupPeriod").ack, AckStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_refused_dispatch_reports_error() {
    let shadows = Arc::new(InMemoryShadowClient::new());
    shadows.insert(
        DEVICE_ID,
        seeded_shadow(
            json!({"$version": 2, "wakeupPeriod": "seconds30"}),
            json!({"$version": 2, "wakeupPeriod": {"value": "none", "ac": 200, "ad": "default", "av": 0}}),
        ),
    );
    let reconciler = ShadowReconciler::new(
        shadows.clone(),
        Arc::new(RefusingDispatcher),
        Arc::new(DeviceRegistry::default()),
    );

    let report = reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert!(matches!(
        report.decisions["wakeupPeriod"],
        PropertyDecision::DispatchFailed(_)
    ));
    let state = reported(&shadows, "wakeupPeriod");
    assert_eq!(state.ack, AckStatus::Error);
    assert_eq!(state.value, json!("none"));
    assert_eq!(state.version, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shadow_read_failure_writes_nothing() {
    let b = bridge();
    b.shadows.fail_reads(true);

    let result = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await;
    assert!(matches!(result, Err(BridgeError::ShadowError(_))));
    assert_eq!(b.shadows.write_count(), 0);
    assert_eq!(b.orchestrator.active_runner_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_completion_is_ignored() {
    let b = bridge();
    b.shadows.insert(
        DEVICE_ID,
        seeded_shadow(
            json!({"$version": 5, "wakeupPeriod": "minutes5"}),
            json!({"$version": 7, "wakeupPeriod": {"value": "seconds30", "ac": 202, "ad": "pending", "av": 5}}),
        ),
    );

    let complete = CommandComplete {
        command_id: Uuid::new_v4(),
        instance_id: InstanceId::from("otaCommand-01459438SKYFEE3-0-70-3"),
        mobile_id: TEST_MOBILE_ID.to_string(),
        completion: Some(CompletionSpec::for_property("wakeupPeriod").with_write(json!("hours1"), 3)),
        delivered: DeliveryResult::delivered(Utc::now(), None),
        response: None,
        final_state: CommandState::Completed,
        timed_out_stage: None,
        completed_at: Utc::now(),
    };

    assert!(b.reconciler.handle_completion(&complete).await.unwrap().is_none());
    assert_eq!(b.shadows.write_count(), 0);

    let untracked = CommandComplete {
        completion: None,
        ..complete
    };
    assert!(b.reconciler.handle_completion(&untracked).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_offline_command_dispatch() {
    let b = bridge();
    let outcome = b
        .reconciler
        .dispatch_command(TEST_MOBILE_ID, "getLocation", &json!({}))
        .await
        .unwrap();
    assert!(outcome.is_started());

    let submitted = wait_for_submissions(&b.submitter, 1).await;
    assert!(submitted[0].completion.is_none());
    assert!(matches!(
        &submitted[0].payload,
        CommandPayload::ModemCommand { command, .. } if command == "getLocation"
    ));

    let again = b
        .reconciler
        .dispatch_command(TEST_MOBILE_ID, "getLocation", &json!({}))
        .await
        .unwrap();
    assert!(matches!(again, StartOutcome::AlreadyActive { .. }));

    let unknown = b
        .reconciler
        .dispatch_command(TEST_MOBILE_ID, "selfDestruct", &json!({}))
        .await;
    assert!(matches!(unknown, Err(BridgeError::DeviceModelError(_))));
}

#[tokio::test(start_paused = true)]
async fn test_write_closes_through_completion_listener() {
    let b = bridge();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let listener = Arc::clone(&b.reconciler)
        .spawn_completion_listener(b.orchestrator.subscribe(), shutdown_rx);

    b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    let version = b.shadows.set_desired(DEVICE_ID, "wakeupPeriod", json!("seconds30"));

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    let instance_id = report.dispatched[0].clone();
    let request = wait_for_submissions(&b.submitter, 1).await.remove(0);
    deliver(&b, &instance_id, &request, 4242).await;

    let state = wait_for_ack(&b.shadows, "wakeupPeriod", AckStatus::Ok).await;
    assert_eq!(state.value, json!("seconds30"));
    assert_eq!(state.version, version);
    assert_eq!(state.description, ack_descriptions::COMPLETED);

    let writes = b.shadows.write_count();
    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(report.decisions["wakeupPeriod"], PropertyDecision::Satisfied);
    assert!(report.dispatched.is_empty());
    assert_eq!(b.shadows.write_count(), writes);

    shutdown.send_replace(true);
    listener.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_proxy_returns_to_idle() {
    let b = bridge();
    let mut events = b.orchestrator.subscribe();

    b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    let version = b.shadows.set_desired(DEVICE_ID, "commandPingModem", json!(true));
    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);

    // Nothing ever comes back from the network
    let complete = next_completion(&mut events).await;
    assert_eq!(complete.final_state, CommandState::TimedOut);

    let patch = b.reconciler.handle_completion(&complete).await.unwrap().unwrap();
    let state = patch.get_state("commandPingModem").unwrap();
    assert_eq!(state.ack, AckStatus::TimedOut);
    assert_eq!(state.value, json!(false));
    assert_eq!(state.version, version);

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(
        report.decisions["commandPingModem"],
        PropertyDecision::Settled(AckStatus::TimedOut)
    );
    assert!(report.dispatched.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pass_recovers_completion_the_listener_missed() {
    let b = bridge();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let listener = Arc::clone(&b.reconciler)
        .spawn_completion_listener(b.orchestrator.subscribe(), shutdown_rx);

    b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    let version = b.shadows.set_desired(DEVICE_ID, "wakeupPeriod", json!("seconds30"));
    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    let instance_id = report.dispatched[0].clone();
    let request = wait_for_submissions(&b.submitter, 1).await.remove(0);

    // The twin is unreachable while the command finishes
    b.shadows.fail_reads(true);
    deliver(&b, &instance_id, &request, 5151).await;
    wait_for_state(&b.orchestrator, &instance_id, CommandState::Completed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.shadows.fail_reads(false);
    assert_eq!(reported(&b.shadows, "wakeupPeriod").ack, AckStatus::Pending);

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(report.decisions["wakeupPeriod"], PropertyDecision::Recovered);
    assert!(report.dispatched.is_empty());

    let state = reported(&b.shadows, "wakeupPeriod");
    assert_eq!(state.ack, AckStatus::Ok);
    assert_eq!(state.value, json!("seconds30"));
    assert_eq!(state.version, version);

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(report.decisions["wakeupPeriod"], PropertyDecision::Satisfied);

    shutdown.send_replace(true);
    listener.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_write_stays_pending_while_running() {
    let b = bridge();
    b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    b.shadows.set_desired(DEVICE_ID, "wakeupPeriod", json!("seconds30"));
    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    wait_for_state(&b.orchestrator, &report.dispatched[0], CommandState::Sending).await;
    let writes = b.shadows.write_count();

    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    assert_eq!(report.decisions["wakeupPeriod"], PropertyDecision::InFlight);
    assert!(!report.patch_written());
    assert_eq!(b.shadows.write_count(), writes);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_completion_after_close_is_ignored() {
    let b = bridge();
    let mut events = b.orchestrator.subscribe();

    b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    let version = b.shadows.set_desired(DEVICE_ID, "wakeupPeriod", json!("seconds30"));
    let report = b.reconciler.run_pass_for_mobile(TEST_MOBILE_ID, None).await.unwrap();
    let instance_id = report.dispatched[0].clone();
    let request = wait_for_submissions(&b.submitter, 1).await.remove(0);
    deliver(&b, &instance_id, &request, 6262).await;

    let complete = next_completion(&mut events).await;
    assert!(b.reconciler.handle_completion(&complete).await.unwrap().is_some());
    assert_eq!(reported(&b.shadows, "wakeupPeriod").ack, AckStatus::Ok);
    let writes = b.shadows.write_count();

    // Same outcome delivered again, e.g. re-emitted after a restart
    assert!(b.reconciler.handle_completion(&complete).await.unwrap().is_none());

    // A late failure for the same version does not reopen the property
    let late_failure = CommandComplete {
        delivered: DeliveryResult::orchestration_timeout(),
        final_state: CommandState::TimedOut,
        ..complete
    };
    assert!(b.reconciler.handle_completion(&late_failure).await.unwrap().is_none());

    assert_eq!(b.shadows.write_count(), writes);
    let state = reported(&b.shadows, "wakeupPeriod");
    assert_eq!(state.ack, AckStatus::Ok);
    assert_eq!(state.version, version);
}
