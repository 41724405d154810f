//! # Command Orchestrator
//!
//! Front end of the command saga engine. Starts one durable instance per
//! deduplicated command, routes inbound network events to the instance waiting
//! for them and resumes persisted instances after a restart.
//!
//! ## Lifecycle
//!
//! ```text
//! Submitting -> Sending -> Delivering -> (AwaitingResponse) -> Completed
//!          \          \            \                    \
//!           Failed     TimedOut     Failed | TimedOut    TimedOut
//! ```
//!
//! Each instance runs as its own tokio task; thousands of waiting instances
//! cost one parked task and one timer-wheel entry each.

use super::clients::CommandSubmitter;
use super::runner::{finalize_detached, OrchestratorContext};
use crate::config::BridgeConfig;
use crate::correlation::{CorrelationIndex, CorrelationKey};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{
    CommandComplete, CommandDelivered, CommandSending, EventPublisher, InboundEvent,
    OrchestrationEvent,
};
use crate::logging::log_instance_operation;
use crate::models::{
    CommandRequest, DeliveryReason, InstanceId, OrchestrationInstance, ResponseMessage,
};
use crate::state_machine::{CommandEvent, CommandState, CreateOutcome, InstanceStore, StageTimeouts};
use crate::timeout::TimeoutScheduler;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Result of asking the orchestrator to start a command
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new instance was created and is running
    Started { instance_id: InstanceId },
    /// A non-terminal instance already holds the id; the request was not started
    AlreadyActive {
        instance_id: InstanceId,
        state: CommandState,
    },
}

impl StartOutcome {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Started { instance_id } | Self::AlreadyActive { instance_id, .. } => instance_id,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// What happened to an inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Delivered to the waiting instance
    Routed { instance_id: InstanceId },
    /// A command request was handed to `start`
    Started(StartOutcome),
    /// No live instance waits for these attributes; dropped
    Unmatched,
    /// Not a final state, nothing to do
    Ignored,
}

/// Summary of a `resume_all` pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeReport {
    pub resumed: usize,
    pub completions_reemitted: usize,
    pub already_running: usize,
}

/// Anything that can accept new commands; implemented by the orchestrator and
/// consumed by the shadow reconciler.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, request: CommandRequest) -> BridgeResult<StartOutcome>;

    /// Outcome of the command under `instance_id` once it has finished;
    /// `None` while it is still running or when nothing is stored.
    async fn finished(&self, instance_id: &InstanceId) -> BridgeResult<Option<CommandComplete>>;
}

#[derive(Clone)]
pub struct CommandOrchestrator {
    context: Arc<OrchestratorContext>,
}

impl CommandOrchestrator {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        submitter: Arc<dyn CommandSubmitter>,
        publisher: EventPublisher,
        timeouts: StageTimeouts,
        mailbox_capacity: usize,
    ) -> Self {
        Self {
            context: Arc::new(OrchestratorContext {
                store,
                index: Arc::new(CorrelationIndex::new()),
                publisher,
                submitter,
                scheduler: TimeoutScheduler::new(),
                timeouts,
                runners: DashMap::new(),
                mailbox_capacity: mailbox_capacity.max(1),
            }),
        }
    }

    pub fn from_config(
        config: &BridgeConfig,
        store: Arc<dyn InstanceStore>,
        submitter: Arc<dyn CommandSubmitter>,
        publisher: EventPublisher,
    ) -> Self {
        Self::new(
            store,
            submitter,
            publisher,
            StageTimeouts::from_config(config),
            config.orchestration.mailbox_capacity,
        )
    }

    /// Start an instance for `request` unless one is already active for its id
    pub async fn start(&self, request: CommandRequest) -> BridgeResult<StartOutcome> {
        request.validate()?;

        let instance = OrchestrationInstance::new(request, Utc::now());
        if instance.is_malformed() {
            return Err(BridgeError::ValidationError(format!(
                "Instance id {} carries invalid correlation markers",
                instance.instance_id
            )));
        }

        let instance_id = instance.instance_id.clone();
        match self.context.store.create(&instance).await? {
            CreateOutcome::AlreadyActive { state } => {
                log_instance_operation(
                    "start",
                    Some(instance_id.as_str()),
                    Some(instance.mobile_id()),
                    Some(state.as_str()),
                    "already_active",
                    Some("duplicate command request rejected"),
                );
                return Ok(StartOutcome::AlreadyActive { instance_id, state });
            }
            CreateOutcome::Replaced { previous_state } => {
                debug!(instance_id = %instance_id, previous_state = %previous_state, "Superseding finished instance");
            }
            CreateOutcome::Created => {}
        }

        log_instance_operation(
            "start",
            Some(instance_id.as_str()),
            Some(instance.mobile_id()),
            Some(CommandState::Submitting.as_str()),
            "started",
            instance.command_request.property_name(),
        );
        self.context.spawn_runner(instance);

        Ok(StartOutcome::Started { instance_id })
    }

    /// Route an inbound event. Unmatched events are dropped, never an error.
    pub async fn handle_inbound(&self, event: InboundEvent) -> BridgeResult<InboundOutcome> {
        match event {
            InboundEvent::CommandRequestReceived(request) => {
                Ok(InboundOutcome::Started(self.start(request).await?))
            }
            InboundEvent::CommandSending(sending) => Ok(self.route_sending(sending).await),
            InboundEvent::CommandDelivered(delivered) => Ok(self.route_delivered(delivered).await),
            InboundEvent::ResponseReceived(response) => Ok(self.route_response(response).await),
            InboundEvent::ForwardStateChange(change) => match change.into_delivered(Utc::now()) {
                Some(delivered) => Ok(self.route_delivered(delivered).await),
                None => Ok(InboundOutcome::Ignored),
            },
        }
    }

    async fn route_sending(&self, sending: CommandSending) -> InboundOutcome {
        let query = CorrelationKey::submission(sending.submission_id);
        let next = CorrelationKey::delivery(sending.message_id);
        self.route(&query, |_| Some(next), CommandEvent::Sending(sending))
            .await
    }

    async fn route_delivered(&self, delivered: CommandDelivered) -> InboundOutcome {
        let query = CorrelationKey::delivery(delivered.message_id);
        let success = delivered.result.success;
        let runners = &self.context.runners;
        self.route(
            &query,
            |instance_id| {
                if !success {
                    return None;
                }
                runners
                    .get(instance_id)
                    .and_then(|handle| handle.expected_response.clone())
                    .map(|(mobile_id, sin, min)| CorrelationKey::response(&mobile_id, sin, min))
            },
            CommandEvent::Delivered(delivered.result),
        )
        .await
    }

    async fn route_response(&self, response: ResponseMessage) -> InboundOutcome {
        let query = CorrelationKey::response(
            &response.mobile_id,
            response.codec_service_id,
            response.codec_message_id,
        );
        self.route(&query, |_| None, CommandEvent::ResponseReceived(response))
            .await
    }

    async fn route<F>(&self, query: &CorrelationKey, next_key: F, event: CommandEvent) -> InboundOutcome
    where
        F: FnOnce(&InstanceId) -> Option<CorrelationKey>,
    {
        let Some((instance_id, _)) = self.context.index.claim_and_rekey(query, next_key) else {
            debug!(query = %query, event = event.event_type(), "No waiting instance for event");
            return InboundOutcome::Unmatched;
        };

        let mailbox = self
            .context
            .runners
            .get(&instance_id)
            .map(|handle| handle.mailbox.clone());

        let delivered = match mailbox {
            Some(mailbox) => mailbox.send(event).await.is_ok(),
            None => false,
        };
        if delivered {
            return InboundOutcome::Routed { instance_id };
        }

        warn!(instance_id = %instance_id, "Matched instance has no live runner; dropping event");
        self.context.index.deregister(&instance_id);
        InboundOutcome::Unmatched
    }

    /// Reload persisted instances after a restart.
    ///
    /// Waiting instances re-enter their wait with the remaining deadline;
    /// terminal instances whose completion was never emitted emit it now.
    pub async fn resume_all(&self) -> BridgeResult<ResumeReport> {
        let mut report = ResumeReport::default();

        for instance in self.context.store.list().await? {
            if self.context.runners.contains_key(&instance.instance_id) {
                report.already_running += 1;
                continue;
            }
            if instance.is_terminal() {
                if instance.completion_emitted {
                    continue;
                }
                report.completions_reemitted += 1;
            } else {
                report.resumed += 1;
            }

            log_instance_operation(
                "resume",
                Some(instance.instance_id.as_str()),
                Some(instance.mobile_id()),
                Some(instance.state.as_str()),
                "resumed",
                None,
            );
            self.context.spawn_runner(instance);
        }

        info!(
            resumed = report.resumed,
            completions_reemitted = report.completions_reemitted,
            already_running = report.already_running,
            "🔄 Resumed persisted instances"
        );
        Ok(report)
    }

    /// Force a non-terminal instance to a terminal state.
    ///
    /// A live runner is told through its mailbox so the single completion
    /// guarantee holds; otherwise the stored instance is finalized here.
    /// Returns `false` when the instance had already finished, even if the
    /// caller's copy still shows it running.
    pub async fn terminate(
        &self,
        instance: &OrchestrationInstance,
        reason: DeliveryReason,
    ) -> BridgeResult<bool> {
        if instance.is_terminal() {
            return Ok(false);
        }

        let mailbox = self
            .context
            .runners
            .get(&instance.instance_id)
            .filter(|handle| handle.command_id == instance.command_request.command_id)
            .map(|handle| handle.mailbox.clone());

        if let Some(mailbox) = mailbox {
            if mailbox.send(CommandEvent::Terminate { reason }).await.is_ok() {
                return Ok(true);
            }
        }

        finalize_detached(&self.context, instance, reason).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.context.publisher.subscribe()
    }

    pub async fn instance(&self, instance_id: &InstanceId) -> BridgeResult<Option<OrchestrationInstance>> {
        Ok(self.context.store.load(instance_id).await?)
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.context.store
    }

    pub fn index(&self) -> &CorrelationIndex {
        &self.context.index
    }

    pub fn has_runner(&self, instance_id: &InstanceId) -> bool {
        self.context.runners.contains_key(instance_id)
    }

    pub fn active_runner_count(&self) -> usize {
        self.context.runners.len()
    }
}

#[async_trait]
impl CommandDispatcher for CommandOrchestrator {
    async fn dispatch(&self, request: CommandRequest) -> BridgeResult<StartOutcome> {
        self.start(request).await
    }

    async fn finished(&self, instance_id: &InstanceId) -> BridgeResult<Option<CommandComplete>> {
        let instance = self.context.store.load(instance_id).await?;
        Ok(instance
            .filter(OrchestrationInstance::is_terminal)
            .map(|instance| CommandComplete::from_instance(&instance, instance.last_updated_at)))
    }
}
