//! Bounded registry of finished transactions

use std::collections::{HashMap, VecDeque};

use crate::types::{TransactionStatus, TxnId};

/// Finished transactions in completion order; the oldest are evicted first
#[derive(Debug)]
pub(crate) struct History {
    limit: usize,
    order: VecDeque<TxnId>,
    entries: HashMap<TxnId, TransactionStatus>,
}

impl History {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Record a finished transaction, returning how many old entries were evicted
    pub(crate) fn push(&mut self, status: TransactionStatus) -> usize {
        let id = status.id;
        if self.entries.insert(id, status).is_none() {
            self.order.push_back(id);
        }
        self.trim()
    }

    /// Evict oldest entries until the cap holds
    pub(crate) fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                evicted += 1;
            }
        }
        evicted
    }

    pub(crate) fn get(&self, id: TxnId) -> Option<&TransactionStatus> {
        self.entries.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TransactionStatus> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }
}
