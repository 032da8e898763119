//! Named savepoints inside a transaction
//!
//! A savepoint remembers how long the operation log was when it was taken.
//! Rolling back truncates the log to that length and drops every savepoint taken
//! after the target, since those point at operations that no longer exist.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, Metadata, TransactionState};

/// Context state captured when a savepoint is taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavepointSnapshot {
    pub state: TransactionState,
    pub lock_count: usize,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Savepoint {
    pub name: String,
    /// Unix epoch millis
    pub created_at: u64,
    /// Creation order within the transaction; breaks ties between equal timestamps
    pub sequence: u64,
    /// Length of the operation log when the savepoint was taken
    pub operation_count: usize,
    pub snapshot: SavepointSnapshot,
}

/// Savepoints of one transaction, keyed by name
#[derive(Debug, Default)]
pub struct SavepointStore {
    savepoints: HashMap<String, Savepoint>,
    next_sequence: u64,
}

impl SavepointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.savepoints.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Savepoint> {
        self.savepoints.get(name)
    }

    pub fn len(&self) -> usize {
        self.savepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.savepoints.is_empty()
    }

    /// Names in creation order
    pub fn names(&self) -> Vec<String> {
        let mut all: Vec<&Savepoint> = self.savepoints.values().collect();
        all.sort_by_key(|sp| sp.sequence);
        all.into_iter().map(|sp| sp.name.clone()).collect()
    }

    /// Insert a new savepoint. Returns `false` if the name is already taken.
    pub fn insert(&mut self, name: &str, operation_count: usize, snapshot: SavepointSnapshot) -> bool {
        if self.savepoints.contains_key(name) {
            return false;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.savepoints.insert(
            name.to_string(),
            Savepoint {
                name: name.to_string(),
                created_at: now_millis(),
                sequence,
                operation_count,
                snapshot,
            },
        );
        true
    }

    /// Drop every savepoint created after `name`, returning their names in
    /// creation order. The target itself is kept so it can be rolled back to again.
    pub fn invalidate_after(&mut self, name: &str) -> Vec<String> {
        let Some(target) = self.savepoints.get(name).map(|sp| sp.sequence) else {
            return Vec::new();
        };
        let mut removed: Vec<Savepoint> = Vec::new();
        self.savepoints.retain(|_, sp| {
            if sp.sequence > target {
                removed.push(sp.clone());
                false
            } else {
                true
            }
        });
        removed.sort_by_key(|sp| sp.sequence);
        removed.into_iter().map(|sp| sp.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SavepointSnapshot {
        SavepointSnapshot {
            state: TransactionState::InProgress,
            lock_count: 0,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut store = SavepointStore::new();
        assert!(store.insert("a", 0, snapshot()));
        assert!(!store.insert("a", 5, snapshot()));
        assert_eq!(store.get("a").unwrap().operation_count, 0);
    }

    #[test]
    fn test_invalidate_after_cascades() {
        let mut store = SavepointStore::new();
        store.insert("a", 0, snapshot());
        store.insert("b", 2, snapshot());
        store.insert("c", 4, snapshot());

        assert_eq!(store.invalidate_after("b"), vec!["c".to_string()]);
        assert_eq!(store.names(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(store.invalidate_after("a"), vec!["b".to_string()]);
        assert!(store.contains("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalidate_unknown_is_noop() {
        let mut store = SavepointStore::new();
        store.insert("a", 0, snapshot());
        assert!(store.invalidate_after("zzz").is_empty());
        assert_eq!(store.len(), 1);
    }
}
