//! # Correlation Index
//!
//! Maps correlation keys to the live orchestration instance waiting on them.
//! Event sources never know instance ids; they present an attribute set and the
//! index finds the instance whose current key matches it.
//!
//! All mutation happens under one write lock so that register, re-key, claim
//! and deregister are atomic with respect to concurrent lookups. Matches are
//! resolved in registration order, so the first registered instance wins a tie.

use super::key::CorrelationKey;
use crate::models::InstanceId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// A registered instance and the key it currently waits under
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedInstance {
    pub instance_id: InstanceId,
    pub key: CorrelationKey,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    sequence: u64,
    key: CorrelationKey,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<InstanceId, Entry>,
    order: BTreeMap<u64, InstanceId>,
    next_sequence: u64,
}

impl IndexState {
    fn first_match(&self, query: &CorrelationKey) -> Option<InstanceId> {
        self.order
            .values()
            .find(|id| {
                self.entries
                    .get(*id)
                    .is_some_and(|entry| entry.key.matches(query))
            })
            .cloned()
    }

    fn remove(&mut self, instance_id: &InstanceId) -> Option<Entry> {
        let entry = self.entries.remove(instance_id)?;
        self.order.remove(&entry.sequence);
        Some(entry)
    }

    fn insert(&mut self, instance_id: &InstanceId, key: CorrelationKey) -> Option<CorrelationKey> {
        let previous = self.remove(instance_id).map(|entry| entry.key);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.order.insert(sequence, instance_id.clone());
        self.entries.insert(
            instance_id.clone(),
            Entry {
                sequence,
                key,
                registered_at: Utc::now(),
            },
        );
        previous
    }
}

#[derive(Debug, Default)]
pub struct CorrelationIndex {
    state: RwLock<IndexState>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-key) an instance. Returns the key it replaced.
    pub fn register(&self, instance_id: &InstanceId, key: CorrelationKey) -> Option<CorrelationKey> {
        let previous = self.state.write().insert(instance_id, key.clone());
        debug!(
            instance_id = %instance_id,
            key = %key,
            previous = ?previous.as_ref().map(ToString::to_string),
            "Correlation key registered"
        );
        previous
    }

    /// First live instance whose key contains every attribute of `query`
    pub fn find_by_attributes(&self, query: &CorrelationKey) -> Option<InstanceId> {
        let found = self.state.read().first_match(query);
        trace!(query = %query, found = ?found.as_ref().map(InstanceId::as_str), "Correlation lookup");
        found
    }

    /// Find and unregister in one step; a second event with the same
    /// attributes finds nothing.
    pub fn claim(&self, query: &CorrelationKey) -> Option<(InstanceId, CorrelationKey)> {
        self.claim_and_rekey(query, |_| None)
    }

    /// Claim a match and, under the same lock, register the key the instance
    /// will wait under next. Events for the next stage that arrive before the
    /// instance has processed this one still find it.
    pub fn claim_and_rekey<F>(
        &self,
        query: &CorrelationKey,
        next_key: F,
    ) -> Option<(InstanceId, CorrelationKey)>
    where
        F: FnOnce(&InstanceId) -> Option<CorrelationKey>,
    {
        let mut state = self.state.write();
        let instance_id = state.first_match(query)?;
        let entry = state.remove(&instance_id)?;
        let next = next_key(&instance_id);
        if let Some(next) = &next {
            state.insert(&instance_id, next.clone());
        }
        debug!(
            instance_id = %instance_id,
            key = %entry.key,
            next = ?next.as_ref().map(ToString::to_string),
            "Correlation key claimed"
        );
        Some((instance_id, entry.key))
    }

    pub fn deregister(&self, instance_id: &InstanceId) -> bool {
        let removed = self.state.write().remove(instance_id).is_some();
        if removed {
            debug!(instance_id = %instance_id, "Correlation key deregistered");
        }
        removed
    }

    /// Deregister only while the instance still waits under `key`. Returns
    /// false once the key has been claimed or re-keyed by an event.
    pub fn deregister_if_key(&self, instance_id: &InstanceId, key: &CorrelationKey) -> bool {
        let mut state = self.state.write();
        let current = state.entries.get(instance_id).map(|entry| &entry.key);
        if current != Some(key) {
            return false;
        }
        state.remove(instance_id);
        debug!(instance_id = %instance_id, key = %key, "Correlation key deregistered");
        true
    }

    pub fn key_for(&self, instance_id: &InstanceId) -> Option<CorrelationKey> {
        self.state
            .read()
            .entries
            .get(instance_id)
            .map(|entry| entry.key.clone())
    }

    /// Snapshot of all registered instances in registration order
    pub fn list_all(&self) -> Vec<IndexedInstance> {
        let state = self.state.read();
        state
            .order
            .values()
            .filter_map(|id| {
                state.entries.get(id).map(|entry| IndexedInstance {
                    instance_id: id.clone(),
                    key: entry.key.clone(),
                    registered_at: entry.registered_at,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
