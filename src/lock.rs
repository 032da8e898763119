//! Advisory lock bookkeeping
//!
//! Locks recorded here are *not* enforced: two transactions may both hold an
//! exclusive lock on the same resource. The coordinator reports such overlaps
//! in the returned [`Lock::conflicts`] and in the log, nothing more.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    #[default]
    Exclusive,
    Shared,
}

impl LockType {
    /// Two holders conflict unless both are shared
    pub fn conflicts_with(&self, other: LockType) -> bool {
        !(*self == LockType::Shared && other == LockType::Shared)
    }
}

/// Options for `acquire_lock`
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    pub lock_type: LockType,
}

impl LockOptions {
    pub fn shared() -> Self {
        Self {
            lock_type: LockType::Shared,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            lock_type: LockType::Exclusive,
        }
    }
}

/// A lock held by one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub resource: String,
    pub lock_type: LockType,
    /// Unix epoch millis
    pub acquired_at: u64,
    pub transaction_id: TxnId,
    /// Other active transactions holding a conflicting lock at acquisition time
    #[serde(default)]
    pub conflicts: Vec<TxnId>,
}

/// Locks held by a single transaction context, keyed by resource
#[derive(Debug, Default)]
pub struct LockTable {
    locks: BTreeMap<String, Lock>,
    released: bool,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lock. Re-acquiring a resource keeps the original timestamp and
    /// upgrades shared to exclusive when asked.
    pub fn acquire(&mut self, owner: TxnId, resource: &str, lock_type: LockType) -> &Lock {
        let lock = self.locks.entry(resource.to_string()).or_insert_with(|| Lock {
            resource: resource.to_string(),
            lock_type,
            acquired_at: now_millis(),
            transaction_id: owner,
            conflicts: Vec::new(),
        });
        if lock_type == LockType::Exclusive {
            lock.lock_type = LockType::Exclusive;
        }
        lock
    }

    pub(crate) fn set_conflicts(&mut self, resource: &str, conflicts: Vec<TxnId>) {
        if let Some(lock) = self.locks.get_mut(resource) {
            lock.conflicts = conflicts;
        }
    }

    pub fn get(&self, resource: &str) -> Option<&Lock> {
        self.locks.get(resource)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn resources(&self) -> Vec<String> {
        self.locks.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values()
    }

    /// Release every lock as a batch. Returns how many were released; a second
    /// call releases nothing.
    pub fn release_all(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let count = self.locks.len();
        self.locks.clear();
        count
    }
}

/// Coordinator-wide view of who holds what, used only to report overlaps
#[derive(Debug, Default)]
pub(crate) struct HolderIndex {
    holders: std::collections::HashMap<String, Vec<(TxnId, LockType)>>,
}

impl HolderIndex {
    /// Register a holder and return the other transactions it conflicts with
    pub(crate) fn register(&mut self, owner: TxnId, resource: &str, lock_type: LockType) -> Vec<TxnId> {
        let entry = self.holders.entry(resource.to_string()).or_default();
        let conflicts = entry
            .iter()
            .filter(|(holder, held)| *holder != owner && held.conflicts_with(lock_type))
            .map(|(holder, _)| *holder)
            .collect();
        match entry.iter_mut().find(|(holder, _)| *holder == owner) {
            Some(existing) => {
                if lock_type == LockType::Exclusive {
                    existing.1 = LockType::Exclusive;
                }
            }
            None => entry.push((owner, lock_type)),
        }
        conflicts
    }

    pub(crate) fn unregister<'a>(&mut self, owner: TxnId, resources: impl IntoIterator<Item = &'a String>) {
        for resource in resources {
            if let Some(entry) = self.holders.get_mut(resource) {
                entry.retain(|(holder, _)| *holder != owner);
                if entry.is_empty() {
                    self.holders.remove(resource);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn holders_of(&self, resource: &str) -> usize {
        self.holders.get(resource).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holder_index_reports_overlaps() {
        let mut index = HolderIndex::default();
        assert!(index.register(TxnId(1), "r", LockType::Shared).is_empty());
        assert!(index.register(TxnId(2), "r", LockType::Shared).is_empty());
        assert_eq!(index.register(TxnId(3), "r", LockType::Exclusive), vec![TxnId(1), TxnId(2)]);
        assert_eq!(index.holders_of("r"), 3);

        let resources = vec!["r".to_string()];
        index.unregister(TxnId(1), &resources);
        index.unregister(TxnId(2), &resources);
        index.unregister(TxnId(3), &resources);
        assert_eq!(index.holders_of("r"), 0);
    }

    #[test]
    fn test_default_lock_is_exclusive() {
        let mut table = LockTable::new();
        let lock = table.acquire(TxnId(1), "accounts:42", LockOptions::default().lock_type);
        assert_eq!(lock.lock_type, LockType::Exclusive);
        assert_eq!(lock.transaction_id, TxnId(1));
    }

    #[test]
    fn test_reacquire_upgrades_shared() {
        let mut table = LockTable::new();
        table.acquire(TxnId(1), "r", LockType::Shared);
        assert_eq!(table.get("r").unwrap().lock_type, LockType::Shared);
        table.acquire(TxnId(1), "r", LockType::Exclusive);
        assert_eq!(table.get("r").unwrap().lock_type, LockType::Exclusive);
        // Downgrade requests are ignored
        table.acquire(TxnId(1), "r", LockType::Shared);
        assert_eq!(table.get("r").unwrap().lock_type, LockType::Exclusive);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_is_once() {
        let mut table = LockTable::new();
        table.acquire(TxnId(1), "a", LockType::Exclusive);
        table.acquire(TxnId(1), "b", LockType::Shared);
        assert_eq!(table.release_all(), 2);
        assert!(table.is_released());
        assert_eq!(table.release_all(), 0);
    }

    #[test]
    fn test_conflict_matrix() {
        assert!(!LockType::Shared.conflicts_with(LockType::Shared));
        assert!(LockType::Shared.conflicts_with(LockType::Exclusive));
        assert!(LockType::Exclusive.conflicts_with(LockType::Shared));
        assert!(LockType::Exclusive.conflicts_with(LockType::Exclusive));
    }
}
