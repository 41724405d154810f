use super::errors::{PersistenceError, PersistenceResult};
use super::states::CommandState;
use crate::models::{InstanceId, OrchestrationInstance};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Result of an atomic create-if-not-active
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// No instance existed under the id
    Created,
    /// A terminal instance was replaced by the new one
    Replaced { previous_state: CommandState },
    /// A non-terminal instance already owns the id; nothing was written
    AlreadyActive { state: CommandState },
}

/// Durable storage for orchestration instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance unless a non-terminal one already holds its id.
    /// Must be atomic with respect to concurrent creates for the same id.
    async fn create(&self, instance: &OrchestrationInstance) -> PersistenceResult<CreateOutcome>;

    /// Persist the current state of an instance.
    ///
    /// Fails with `Superseded` when the stored row now belongs to a different
    /// command (the id was reused after this instance went terminal), and with
    /// `AlreadyTerminal` when the stored row already reached a terminal state
    /// other than the one being written. A terminal outcome is never rewritten.
    async fn save(&self, instance: &OrchestrationInstance) -> PersistenceResult<()>;

    async fn load(&self, instance_id: &InstanceId) -> PersistenceResult<Option<OrchestrationInstance>>;

    async fn list(&self) -> PersistenceResult<Vec<OrchestrationInstance>>;

    async fn delete(&self, instance_id: &InstanceId) -> PersistenceResult<bool>;
}

/// In-memory implementation for development and testing
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<InstanceId, OrchestrationInstance>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, instance: &OrchestrationInstance) -> PersistenceResult<CreateOutcome> {
        match self.instances.entry(instance.instance_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().state;
                if existing.is_terminal() {
                    occupied.insert(instance.clone());
                    debug!(instance_id = %instance.instance_id, previous_state = %existing, "Replaced terminal instance");
                    Ok(CreateOutcome::Replaced {
                        previous_state: existing,
                    })
                } else {
                    Ok(CreateOutcome::AlreadyActive { state: existing })
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(instance.clone());
                Ok(CreateOutcome::Created)
            }
        }
    }

    async fn save(&self, instance: &OrchestrationInstance) -> PersistenceResult<()> {
        match self.instances.entry(instance.instance_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get();
                if stored.command_request.command_id != instance.command_request.command_id {
                    return Err(PersistenceError::Superseded {
                        instance_id: instance.instance_id.to_string(),
                    });
                }
                if stored.state.is_terminal() && stored.state != instance.state {
                    return Err(PersistenceError::AlreadyTerminal {
                        instance_id: instance.instance_id.to_string(),
                        state: stored.state.to_string(),
                    });
                }
                occupied.insert(instance.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(instance.clone());
            }
        }
        Ok(())
    }

    async fn load(&self, instance_id: &InstanceId) -> PersistenceResult<Option<OrchestrationInstance>> {
        Ok(self.instances.get(instance_id).map(|entry| entry.clone()))
    }

    async fn list(&self) -> PersistenceResult<Vec<OrchestrationInstance>> {
        let mut instances: Vec<_> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by_key(|instance| instance.created_at);
        Ok(instances)
    }

    async fn delete(&self, instance_id: &InstanceId) -> PersistenceResult<bool> {
        Ok(self.instances.remove(instance_id).is_some())
    }
}
