use super::types::OrchestrationEvent;
use crate::constants::defaults;
use tokio::sync::broadcast;
use tracing::trace;

/// Fan-out publisher for orchestration lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event, returning how many subscribers received it.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: OrchestrationEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(event = name, receivers, "Published orchestration event");
                receivers
            }
            Err(broadcast::error::SendError(_)) => 0,
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(defaults::EVENT_CHANNEL_CAPACITY)
    }
}
