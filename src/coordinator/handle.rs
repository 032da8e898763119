use crate::error::Result;
use crate::lock::{Lock, LockOptions};
use crate::types::{
    AbortOptions, AbortOutcome, CommitOptions, CommitOutcome, Operation, RollbackOutcome,
    SavepointInfo, TransactionStatus, TxnId,
};

use super::TransactionCoordinator;

/// A started transaction: its id plus a way back to the coordinator.
///
/// Every method forwards to the coordinator, so a handle and a bare [`TxnId`]
/// are interchangeable.
#[derive(Clone)]
pub struct TransactionHandle {
    id: TxnId,
    coordinator: TransactionCoordinator,
}

impl TransactionHandle {
    pub(crate) fn new(id: TxnId, coordinator: TransactionCoordinator) -> Self {
        Self { id, coordinator }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub async fn log_operation(&self, operation: Operation) -> Result<()> {
        self.coordinator.log_operation(self.id, operation).await
    }

    pub async fn create_savepoint(&self, name: &str) -> Result<SavepointInfo> {
        self.coordinator.create_savepoint(self.id, name).await
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<RollbackOutcome> {
        self.coordinator.rollback_to_savepoint(self.id, name).await
    }

    pub async fn acquire_lock(&self, resource: &str, options: LockOptions) -> Result<Lock> {
        self.coordinator.acquire_lock(self.id, resource, options).await
    }

    pub async fn status(&self) -> Option<TransactionStatus> {
        self.coordinator.get_transaction_status(self.id).await
    }

    pub async fn commit(&self) -> Result<CommitOutcome> {
        self.coordinator
            .commit_transaction(self.id, CommitOptions::default())
            .await
    }

    pub async fn abort(&self, reason: impl Into<String>) -> Result<AbortOutcome> {
        self.coordinator
            .abort_transaction(self.id, AbortOptions::reason(reason))
            .await
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransactionHandle").field(&self.id).finish()
    }
}

impl From<&TransactionHandle> for TxnId {
    fn from(handle: &TransactionHandle) -> Self {
        handle.id
    }
}

impl From<TransactionHandle> for TxnId {
    fn from(handle: TransactionHandle) -> Self {
        handle.id
    }
}
