//! Per-instance task driving one command through its stages.
//!
//! Each waiting stage races the instance mailbox against the stage timer. The
//! correlation index is the arbiter: an event is only delivered to the mailbox
//! after its key was claimed, and a timer only wins if it can still remove the
//! key itself.

use super::clients::CommandSubmitter;
use crate::correlation::CorrelationIndex;
use crate::error::BridgeResult;
use crate::events::EventPublisher;
use crate::logging::{log_error, log_instance_operation};
use crate::models::{DeliveryReason, InstanceId, OrchestrationInstance};
use crate::state_machine::{
    determine_target_state, CommandEvent, CommandStateMachine, InstanceStore, StageTimeouts,
    StateMachineError,
};
use crate::timeout::TimeoutScheduler;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bound on waiting for an event whose key was claimed just as the timer fired
const CLAIM_HANDOFF_GRACE: Duration = Duration::from_secs(1);

/// Live runner for an instance id
#[derive(Debug, Clone)]
pub(crate) struct RunnerHandle {
    pub command_id: Uuid,
    pub mailbox: mpsc::Sender<CommandEvent>,
    /// (mobile id, codec service id, codec message id) of the awaited reply
    pub expected_response: Option<(String, u8, u8)>,
}

/// Shared state every runner and the orchestrator front end work against
pub(crate) struct OrchestratorContext {
    pub store: Arc<dyn InstanceStore>,
    pub index: Arc<CorrelationIndex>,
    pub publisher: EventPublisher,
    pub submitter: Arc<dyn CommandSubmitter>,
    pub scheduler: TimeoutScheduler,
    pub timeouts: StageTimeouts,
    pub runners: DashMap<InstanceId, RunnerHandle>,
    pub mailbox_capacity: usize,
}

impl OrchestratorContext {
    /// Register the instance's current key and spawn its runner task
    pub fn spawn_runner(self: &Arc<Self>, instance: OrchestrationInstance) {
        let (sender, receiver) = mpsc::channel(self.mailbox_capacity);
        let request = &instance.command_request;
        let handle = RunnerHandle {
            command_id: request.command_id,
            mailbox: sender,
            expected_response: request
                .expected_response()
                .map(|(sin, min)| (request.mobile_id.clone(), sin, min)),
        };

        self.runners.insert(instance.instance_id.clone(), handle);
        if let Some(key) = instance.correlation_key() {
            self.index.register(&instance.instance_id, key);
        }

        let context = Arc::clone(self);
        tokio::spawn(async move { run_instance(context, instance, receiver).await });
    }
}

async fn run_instance(
    context: Arc<OrchestratorContext>,
    instance: OrchestrationInstance,
    mut mailbox: mpsc::Receiver<CommandEvent>,
) {
    let instance_id = instance.instance_id.clone();
    let command_id = instance.command_request.command_id;
    let mut machine = CommandStateMachine::new(
        instance,
        context.store.clone(),
        context.publisher.clone(),
        context.timeouts.clone(),
    );

    if let Err(error) = drive(&context, &mut machine, &mut mailbox).await {
        match &error {
            StateMachineError::Superseded { .. } => {
                debug!(instance_id = %instance_id, "Runner stopped: instance superseded");
            }
            StateMachineError::AlreadyTerminal { state, .. } => {
                debug!(instance_id = %instance_id, state = %state, "Runner stopped: instance finished elsewhere");
            }
            _ => log_error(
                "command_runner",
                "drive",
                &error.to_string(),
                Some(instance_id.as_str()),
            ),
        }
        if !machine.current_state().is_terminal() {
            context.index.deregister(&instance_id);
        }
    }

    context
        .runners
        .remove_if(&instance_id, |_, handle| handle.command_id == command_id);
}

async fn drive(
    context: &OrchestratorContext,
    machine: &mut CommandStateMachine,
    mailbox: &mut mpsc::Receiver<CommandEvent>,
) -> Result<(), StateMachineError> {
    loop {
        let state = machine.current_state();
        if state.is_terminal() {
            machine.complete(Utc::now()).await?;
            return Ok(());
        }

        let event = if state.is_waiting() {
            wait_for_event(context, machine, mailbox).await
        } else {
            submit(context, machine).await?
        };

        apply(context, machine, event).await?;
    }
}

/// The only side-effecting stage. Never repeated for a resumed instance.
async fn submit(
    context: &OrchestratorContext,
    machine: &mut CommandStateMachine,
) -> Result<CommandEvent, StateMachineError> {
    let instance_id = machine.instance_id().to_string();

    if machine.instance().submission_attempted_at.is_some() {
        log_instance_operation(
            "submit",
            Some(&instance_id),
            Some(machine.instance().mobile_id()),
            Some("submitting"),
            "skipped",
            Some("resumed after submission attempt"),
        );
        return Ok(CommandEvent::Submitted);
    }

    machine.mark_submission_attempted(Utc::now()).await?;

    let request = machine.instance().command_request.clone();
    let event = match context.submitter.submit_command(&request).await {
        Ok(true) => CommandEvent::Submitted,
        Ok(false) => CommandEvent::SubmissionFailed("submission rejected by network".to_string()),
        Err(error) => CommandEvent::SubmissionFailed(error.to_string()),
    };

    log_instance_operation(
        "submit",
        Some(&instance_id),
        Some(&request.mobile_id),
        Some("submitting"),
        if matches!(event, CommandEvent::Submitted) {
            "accepted"
        } else {
            "failed"
        },
        event.error_message(),
    );
    Ok(event)
}

/// Race the mailbox against the stage deadline
async fn wait_for_event(
    context: &OrchestratorContext,
    machine: &CommandStateMachine,
    mailbox: &mut mpsc::Receiver<CommandEvent>,
) -> CommandEvent {
    let instance = machine.instance();
    let now = Utc::now();
    let deadline = instance.stage_deadline.or_else(|| {
        context
            .timeouts
            .deadline_for(instance.state, instance.sending.as_ref(), instance.stage_started_at)
    });
    let mut timer = match deadline {
        Some(deadline) => context.scheduler.until(deadline, now),
        None => context.scheduler.after(Duration::ZERO),
    };

    tokio::select! {
        biased;
        Some(event) = mailbox.recv() => {
            timer.cancel();
            event
        }
        _ = &mut timer => {
            let won = instance
                .correlation_key()
                .map_or(true, |key| context.index.deregister_if_key(&instance.instance_id, &key));
            if won {
                CommandEvent::StageTimedOut
            } else {
                // An event claimed the key first; it is on its way
                match tokio::time::timeout(CLAIM_HANDOFF_GRACE, mailbox.recv()).await {
                    Ok(Some(event)) => event,
                    _ => CommandEvent::StageTimedOut,
                }
            }
        }
    }
}

async fn apply(
    context: &OrchestratorContext,
    machine: &mut CommandStateMachine,
    event: CommandEvent,
) -> Result<(), StateMachineError> {
    let instance = machine.instance();
    let target = match determine_target_state(
        instance.state,
        &event,
        instance.command_request.expected_response().is_some(),
    ) {
        Ok(target) => target,
        Err(error) => {
            warn!(
                instance_id = %instance.instance_id,
                state = %instance.state,
                event = event.event_type(),
                error = %error,
                "Discarding event that does not apply to the current stage"
            );
            return Ok(());
        }
    };

    if target.is_terminal() {
        context.index.deregister(&instance.instance_id);
    }

    let from = instance.state;
    let event_type = event.event_type();
    machine.transition(event, Utc::now()).await?;

    log_instance_operation(
        event_type,
        Some(machine.instance_id().as_str()),
        Some(machine.instance().mobile_id()),
        Some(from.as_str()),
        target.as_str(),
        None,
    );
    Ok(())
}

/// Force an instance with no live runner to a terminal state and emit its
/// completion.
///
/// Works from the stored row rather than the caller's copy: returns `false`
/// when the row is gone, already terminal, or owned by a newer command.
pub(crate) async fn finalize_detached(
    context: &OrchestratorContext,
    instance: &OrchestrationInstance,
    reason: DeliveryReason,
) -> BridgeResult<bool> {
    let Some(stored) = context.store.load(&instance.instance_id).await? else {
        return Ok(false);
    };
    if stored.is_terminal()
        || stored.command_request.command_id != instance.command_request.command_id
    {
        debug!(
            instance_id = %instance.instance_id,
            state = %stored.state,
            "Instance already finished; terminate skipped"
        );
        return Ok(false);
    }

    let mut machine = CommandStateMachine::new(
        stored,
        context.store.clone(),
        context.publisher.clone(),
        context.timeouts.clone(),
    );
    match apply(context, &mut machine, CommandEvent::Terminate { reason }).await {
        Ok(()) => {}
        // Lost the race against a runner that finished the instance first
        Err(StateMachineError::AlreadyTerminal { .. } | StateMachineError::Superseded { .. }) => {
            return Ok(false);
        }
        Err(error) => return Err(error.into()),
    }
    machine.complete(Utc::now()).await?;
    Ok(true)
}
