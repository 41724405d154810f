use super::{
    errors::{StateMachineError, StateMachineResult},
    events::CommandEvent,
    persistence::InstanceStore,
    states::CommandState,
};
use crate::config::{BridgeConfig, DeliveryDeadlineConfig, OrchestrationConfig};
use crate::events::publisher::EventPublisher;
use crate::events::types::{CommandComplete, CommandSending, OrchestrationEvent, StageTransition};
use crate::models::{DeliveryReason, DeliveryResult, InstanceId, OrchestrationInstance};
use crate::timeout::compute_delivery_deadline;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-stage wait limits, resolved when a stage is entered
#[derive(Debug, Clone, Default)]
pub struct StageTimeouts {
    orchestration: OrchestrationConfig,
    delivery: DeliveryDeadlineConfig,
}

impl StageTimeouts {
    pub fn new(orchestration: OrchestrationConfig, delivery: DeliveryDeadlineConfig) -> Self {
        Self {
            orchestration,
            delivery,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.orchestration.clone(), config.delivery_deadline.clone())
    }

    /// Wall-clock deadline for the wait in `state`, `None` for states that do not wait
    pub fn deadline_for(
        &self,
        state: CommandState,
        sending: Option<&CommandSending>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let wait = match state {
            CommandState::Sending => self.orchestration.sending_timeout(),
            CommandState::Delivering => compute_delivery_deadline(
                &self.delivery,
                self.orchestration.delivery_timeout(),
                sending.and_then(|s| s.scheduled_send_time_utc.as_deref()),
                sending.and_then(|s| s.size),
                now,
            ),
            CommandState::AwaitingResponse => self.orchestration.response_timeout(),
            _ => return None,
        };
        Some(deadline_after(now, wait))
    }
}

fn deadline_after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Command lifecycle state machine.
///
/// Every transition is persisted before it is published, so a restarted
/// process resumes from the last completed stage.
pub struct CommandStateMachine {
    instance: OrchestrationInstance,
    store: Arc<dyn InstanceStore>,
    event_publisher: EventPublisher,
    timeouts: StageTimeouts,
}

impl CommandStateMachine {
    pub fn new(
        instance: OrchestrationInstance,
        store: Arc<dyn InstanceStore>,
        event_publisher: EventPublisher,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            instance,
            store,
            event_publisher,
            timeouts,
        }
    }

    pub fn current_state(&self) -> CommandState {
        self.instance.state
    }

    pub fn instance(&self) -> &OrchestrationInstance {
        &self.instance
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance.instance_id
    }

    /// Record that the side-effecting submission is about to happen
    pub async fn mark_submission_attempted(&mut self, now: DateTime<Utc>) -> StateMachineResult<()> {
        self.instance.submission_attempted_at = Some(now);
        self.instance.last_updated_at = now;
        self.persist().await
    }

    /// Attempt to transition the command state
    pub async fn transition(
        &mut self,
        event: CommandEvent,
        now: DateTime<Utc>,
    ) -> StateMachineResult<CommandState> {
        let current_state = self.instance.state;
        let target_state = determine_target_state(
            current_state,
            &event,
            self.instance.command_request.expected_response().is_some(),
        )?;

        self.check_guards(current_state, target_state)?;

        let event_type = event.event_type();
        self.apply_event(current_state, target_state, event, now);
        self.persist().await?;

        debug!(
            instance_id = %self.instance.instance_id,
            from_state = %current_state,
            to_state = %target_state,
            event = event_type,
            "Command state transition"
        );

        self.event_publisher
            .publish(OrchestrationEvent::StageTransition(StageTransition {
                instance_id: self.instance.instance_id.clone(),
                mobile_id: self.instance.mobile_id().to_string(),
                from_state: current_state,
                to_state: target_state,
                event: event_type.to_string(),
                transitioned_at: now,
            }));

        Ok(target_state)
    }

    /// Emit the terminal `CommandComplete` unless it has already been emitted
    pub async fn complete(&mut self, now: DateTime<Utc>) -> StateMachineResult<Option<CommandComplete>> {
        if !self.instance.is_terminal() {
            return Err(StateMachineError::GuardFailed {
                reason: format!(
                    "instance {} is not terminal ({})",
                    self.instance.instance_id, self.instance.state
                ),
            });
        }
        if self.instance.completion_emitted {
            return Ok(None);
        }

        let completion = CommandComplete::from_instance(&self.instance, now);

        self.event_publisher
            .publish(OrchestrationEvent::CommandComplete(completion.clone()));

        self.instance.completion_emitted = true;
        self.instance.last_updated_at = now;
        self.persist().await?;

        info!(
            instance_id = %self.instance.instance_id,
            mobile_id = %completion.mobile_id,
            final_state = %completion.final_state,
            success = completion.delivered.success,
            reason = %completion.delivered.reason,
            "✅ Command complete"
        );

        Ok(Some(completion))
    }

    /// Reject anything that would revisit a state
    fn check_guards(
        &self,
        current_state: CommandState,
        target_state: CommandState,
    ) -> StateMachineResult<()> {
        if target_state.rank() <= current_state.rank() {
            return Err(StateMachineError::GuardFailed {
                reason: format!("{current_state} -> {target_state} is not forward"),
            });
        }
        Ok(())
    }

    fn apply_event(
        &mut self,
        current_state: CommandState,
        target_state: CommandState,
        event: CommandEvent,
        now: DateTime<Utc>,
    ) {
        let instance = &mut self.instance;
        match event {
            CommandEvent::Submitted => {}
            CommandEvent::SubmissionFailed(message) => {
                instance.delivered = Some(DeliveryResult::failed(DeliveryReason::Error, Some(now)));
                instance.failure_reason = Some(message);
            }
            CommandEvent::Sending(sending) => {
                instance.sending = Some(sending);
            }
            CommandEvent::Delivered(result) => {
                if !result.success {
                    instance.failure_reason = Some(result.reason.to_string());
                }
                instance.delivered = Some(result);
            }
            CommandEvent::ResponseReceived(response) => {
                instance.response = Some(response);
            }
            CommandEvent::StageTimedOut => {
                instance.timed_out_stage = Some(current_state);
                // Past delivery only the reply is missing; the delivery stands
                if current_state != CommandState::AwaitingResponse {
                    instance.delivered = Some(DeliveryResult::orchestration_timeout());
                }
                instance.failure_reason = Some(DeliveryReason::OrchestrationTimeout.to_string());
            }
            CommandEvent::Terminate { reason } => {
                let delivery_stands = current_state == CommandState::AwaitingResponse
                    && reason.is_timeout()
                    && instance.delivered.as_ref().is_some_and(|d| d.success);
                if reason.is_timeout() {
                    instance.timed_out_stage = Some(current_state);
                }
                if !delivery_stands {
                    instance.delivered = Some(DeliveryResult::failed(reason, Some(now)));
                }
                instance.failure_reason = Some(format!("terminated: {reason}"));
            }
        }

        instance.state = target_state;
        instance.stage_started_at = now;
        instance.last_updated_at = now;
        instance.stage_deadline = self
            .timeouts
            .deadline_for(target_state, instance.sending.as_ref(), now);
    }

    async fn persist(&self) -> StateMachineResult<()> {
        self.store.save(&self.instance).await?;
        Ok(())
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(
    current_state: CommandState,
    event: &CommandEvent,
    expects_response: bool,
) -> StateMachineResult<CommandState> {
    let target = match (current_state, event) {
        (CommandState::Submitting, CommandEvent::Submitted) => CommandState::Sending,
        (CommandState::Submitting, CommandEvent::SubmissionFailed(_)) => CommandState::Failed,

        (CommandState::Sending, CommandEvent::Sending(_)) => CommandState::Delivering,

        (CommandState::Delivering, CommandEvent::Delivered(result)) => {
            match (result.success, expects_response) {
                (true, true) => CommandState::AwaitingResponse,
                (true, false) => CommandState::Completed,
                (false, _) => CommandState::Failed,
            }
        }

        (CommandState::AwaitingResponse, CommandEvent::ResponseReceived(_)) => {
            CommandState::Completed
        }

        (state, CommandEvent::StageTimedOut) if state.is_waiting() => CommandState::TimedOut,

        (state, CommandEvent::Terminate { reason }) if !state.is_terminal() => {
            if reason.is_timeout() {
                CommandState::TimedOut
            } else {
                CommandState::Failed
            }
        }

        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: Some(from_state.to_string()),
                to: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}
