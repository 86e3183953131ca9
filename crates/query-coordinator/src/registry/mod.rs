//! Table of live operations.
//!
//! Operations live in an id keyed table. Deduplicated operations are also
//! reachable through their [`OperationKey`]; an operation is unlinked from that
//! index in the same registry turn its reference count drops to zero, so a later
//! request for the same key always starts a fresh operation.

mod key;
mod operation;

use std::{collections::HashMap, fmt};

pub use key::OperationKey;
pub(crate) use operation::Operation;

/// Identifies an operation for its whole life, restarts included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    #[cfg(test)]
    pub(crate) fn new(id: u64) -> Self {
        OperationId(id)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Incremented on every restart. Results and deliveries of older epochs are discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(u64);

impl Epoch {
    #[must_use]
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one subscriber across attachments to successive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    #[cfg(test)]
    pub(crate) fn new(id: u64) -> Self {
        SubscriberId(id)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    operations: HashMap<OperationId, Operation>,
    index: HashMap<OperationKey, OperationId>,
    next_operation: u64,
    next_subscriber: u64,
    shut_down: bool,
}

impl Registry {
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn next_subscriber_id(&mut self) -> SubscriberId {
        self.next_subscriber += 1;
        SubscriberId(self.next_subscriber)
    }

    /// The live, deduplicated operation registered under this key.
    pub fn find(&self, key: &OperationKey) -> Option<OperationId> {
        self.index.get(key).copied()
    }

    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    pub fn get_mut(&mut self, id: OperationId) -> Option<&mut Operation> {
        self.operations.get_mut(&id)
    }

    /// Registers a new operation, indexing it under its key when it takes part in
    /// deduplication.
    pub fn insert(&mut self, operation: Operation) -> OperationId {
        self.next_operation += 1;
        let id = OperationId(self.next_operation);

        if operation.indexed {
            if let Some(previous) = self.index.insert(operation.key.clone(), id) {
                tracing::debug!(%previous, %id, "operation replaced in the deduplication index");
            }
        }

        self.operations.insert(id, operation);
        id
    }

    /// Removes an operation and unlinks it from the key index.
    pub fn remove(&mut self, id: OperationId) -> Option<Operation> {
        let operation = self.operations.remove(&id)?;

        if operation.indexed && self.index.get(&operation.key) == Some(&id) {
            self.index.remove(&operation.key);
        }

        Some(operation)
    }

    /// Marks the registry as shut down and hands back every operation.
    pub fn shut_down(&mut self) -> Vec<(OperationId, Operation)> {
        self.shut_down = true;
        self.index.clear();
        self.operations.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::FetchPolicy,
        document::{Document, OperationRequest},
    };

    fn operation(indexed: bool) -> Operation {
        let request = OperationRequest::new(Document::parse("{ a }", None).unwrap());
        let key = OperationKey::new(&request, None);
        Operation::new(key, indexed, request, FetchPolicy::NetworkOnly)
    }

    #[test]
    fn only_indexed_operations_are_found_by_key() {
        let mut registry = Registry::default();

        let hidden = operation(false);
        let key = hidden.key.clone();
        let hidden = registry.insert(hidden);
        assert_eq!(registry.find(&key), None);

        let shared = registry.insert(operation(true));
        assert_eq!(registry.find(&key), Some(shared));
        assert_ne!(hidden, shared);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn removal_unlinks_the_key() {
        let mut registry = Registry::default();
        let first = registry.insert(operation(true));
        let key = registry.get(first).unwrap().key.clone();

        registry.remove(first);
        assert_eq!(registry.find(&key), None);
        assert!(registry.get(first).is_none());

        let second = registry.insert(operation(true));
        assert_ne!(first, second);
        assert_eq!(registry.find(&key), Some(second));
    }

    #[test]
    fn removing_a_stale_entry_keeps_the_newer_one_indexed() {
        let mut registry = Registry::default();
        let first = registry.insert(operation(true));
        let second = registry.insert(operation(true));
        let key = registry.get(second).unwrap().key.clone();

        registry.remove(first);
        assert_eq!(registry.find(&key), Some(second));
    }
}
