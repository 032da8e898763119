//! In-memory transaction context

use std::time::{Duration, Instant};

use crate::error::{CoordinatorError, Result};
use crate::lock::LockTable;
use crate::provider::Session;
use crate::savepoint::{SavepointSnapshot, SavepointStore};
use crate::types::{
    now_millis, IsolationLevel, Metadata, Operation, OperationRecord, RollbackOutcome,
    SavepointInfo, TransactionState, TransactionStatus, TxnId,
};

/// Everything the coordinator knows about one transaction.
///
/// Owned by the coordinator behind a per-context async mutex; all mutation goes
/// through the methods below so the lifecycle graph is enforced in one place.
pub struct TransactionContext {
    id: TxnId,
    state: TransactionState,
    /// Every state this context has been in, oldest first
    state_history: Vec<TransactionState>,
    pub(crate) session: Option<Box<dyn Session>>,
    connection: String,
    isolation_level: IsolationLevel,
    distributed: bool,
    participants: Vec<String>,
    operations: Vec<OperationRecord>,
    pub(crate) savepoints: SavepointStore,
    pub(crate) locks: LockTable,
    started: Instant,
    start_time: u64,
    end_time: Option<u64>,
    duration: Option<Duration>,
    abort_reason: Option<String>,
    pub(crate) metadata: Metadata,
}

impl TransactionContext {
    pub fn new(
        id: TxnId,
        connection: String,
        isolation_level: IsolationLevel,
        distributed: bool,
        participants: Vec<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Pending,
            state_history: vec![TransactionState::Pending],
            session: None,
            connection,
            isolation_level,
            distributed,
            participants,
            operations: Vec::new(),
            savepoints: SavepointStore::new(),
            locks: LockTable::new(),
            started: Instant::now(),
            start_time: now_millis(),
            end_time: None,
            duration: None,
            abort_reason: None,
            metadata,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn state_history(&self) -> &[TransactionState] {
        &self.state_history
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn operations(&self) -> &[OperationRecord] {
        &self.operations
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub(crate) fn set_abort_reason(&mut self, reason: String) {
        self.abort_reason = Some(reason);
    }

    /// Move to `next`, refusing anything that is not an edge of the lifecycle graph
    pub(crate) fn transition(&mut self, next: TransactionState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoordinatorError::InvalidState {
                id: self.id,
                actual: self.state,
                operation,
            });
        }
        log::debug!("{}: {} -> {}", self.id, self.state, next);
        self.state = next;
        self.state_history.push(next);
        if next.is_terminal() {
            self.end_time = Some(now_millis());
            self.duration = Some(self.started.elapsed());
        }
        Ok(())
    }

    fn require_in_progress(&self, operation: &'static str) -> Result<()> {
        if self.state != TransactionState::InProgress {
            return Err(CoordinatorError::InvalidState {
                id: self.id,
                actual: self.state,
                operation,
            });
        }
        Ok(())
    }

    /// Append to the operation log, returning the new record's position
    pub(crate) fn log_operation(&mut self, operation: Operation) -> Result<usize> {
        self.require_in_progress("log operation")?;
        let seq = self.operations.len();
        self.operations.push(OperationRecord {
            seq,
            timestamp: now_millis(),
            operation,
        });
        Ok(seq)
    }

    pub(crate) fn create_savepoint(&mut self, name: &str) -> Result<SavepointInfo> {
        if name.trim().is_empty() {
            return Err(CoordinatorError::MissingSavepointName);
        }
        self.require_in_progress("create savepoint")?;

        let snapshot = SavepointSnapshot {
            state: self.state,
            lock_count: self.locks.len(),
            metadata: self.metadata.clone(),
        };
        let operation_count = self.operations.len();
        if !self.savepoints.insert(name, operation_count, snapshot) {
            return Err(CoordinatorError::SavepointExists {
                id: self.id,
                name: name.to_string(),
            });
        }
        log::debug!("{}: savepoint '{}' at {} operations", self.id, name, operation_count);

        Ok(SavepointInfo {
            id: self.id,
            name: name.to_string(),
            operation_count,
        })
    }

    pub(crate) fn rollback_to_savepoint(&mut self, name: &str) -> Result<RollbackOutcome> {
        if name.trim().is_empty() {
            return Err(CoordinatorError::MissingSavepointName);
        }
        self.require_in_progress("roll back to savepoint")?;

        let target = self
            .savepoints
            .get(name)
            .map(|sp| sp.operation_count)
            .ok_or_else(|| CoordinatorError::SavepointNotFound {
                id: self.id,
                name: name.to_string(),
            })?;

        let operations_removed = self.operations.len().saturating_sub(target);
        self.operations.truncate(target);
        let savepoints_removed = self.savepoints.invalidate_after(name);

        log::debug!(
            "{}: rolled back to '{}' ({} operations, {} savepoints dropped)",
            self.id,
            name,
            operations_removed,
            savepoints_removed.len()
        );

        Ok(RollbackOutcome {
            id: self.id,
            name: name.to_string(),
            operations_removed,
            savepoints_removed,
        })
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus {
            id: self.id,
            state: self.state,
            state_history: self.state_history.clone(),
            connection: self.connection.clone(),
            isolation_level: self.isolation_level,
            distributed: self.distributed,
            participants: self.participants.clone(),
            operation_count: self.operations.len(),
            savepoints: self.savepoints.names(),
            locks: self.locks.resources(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: self.duration.map(|d| d.as_millis() as u64),
            abort_reason: self.abort_reason.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("connection", &self.connection)
            .field("distributed", &self.distributed)
            .field("operations", &self.operations.len())
            .field("savepoints", &self.savepoints.len())
            .field("locks", &self.locks.len())
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TransactionContext {
        let mut ctx = TransactionContext::new(
            TxnId(1),
            "default".into(),
            IsolationLevel::Snapshot,
            false,
            Vec::new(),
            Metadata::new(),
        );
        ctx.transition(TransactionState::InProgress, "start").unwrap();
        ctx
    }

    #[test]
    fn test_context_creation() {
        let ctx = TransactionContext::new(
            TxnId(9),
            "db".into(),
            IsolationLevel::ReadCommitted,
            true,
            vec!["a".into()],
            Metadata::new(),
        );
        assert_eq!(ctx.state(), TransactionState::Pending);
        assert_eq!(ctx.participants(), &["a".to_string()]);
        assert!(ctx.duration().is_none());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut ctx = context();
        let err = ctx.transition(TransactionState::Committed, "commit").unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSACTION_STATE");
        assert_eq!(ctx.state(), TransactionState::InProgress);
    }

    #[test]
    fn test_terminal_records_duration() {
        let mut ctx = context();
        ctx.transition(TransactionState::Aborting, "abort").unwrap();
        ctx.transition(TransactionState::Aborted, "abort").unwrap();
        assert!(ctx.duration().is_some());
        assert!(ctx.status().end_time.is_some());
        assert_eq!(
            ctx.state_history(),
            &[
                TransactionState::Pending,
                TransactionState::InProgress,
                TransactionState::Aborting,
                TransactionState::Aborted
            ]
        );
    }

    #[test]
    fn test_savepoint_round_trip() {
        let mut ctx = context();
        ctx.log_operation(Operation::new("insert")).unwrap();
        ctx.create_savepoint("a").unwrap();
        for _ in 0..3 {
            ctx.log_operation(Operation::new("update")).unwrap();
        }
        let outcome = ctx.rollback_to_savepoint("a").unwrap();
        assert_eq!(outcome.operations_removed, 3);
        assert_eq!(ctx.operation_count(), 1);

        // The target survives and can be reused
        ctx.log_operation(Operation::new("delete")).unwrap();
        assert_eq!(ctx.rollback_to_savepoint("a").unwrap().operations_removed, 1);
    }

    #[test]
    fn test_savepoint_errors() {
        let mut ctx = context();
        assert_eq!(
            ctx.create_savepoint("  ").unwrap_err().code(),
            "MISSING_SAVEPOINT_NAME"
        );
        ctx.create_savepoint("a").unwrap();
        assert_eq!(ctx.create_savepoint("a").unwrap_err().code(), "SAVEPOINT_EXISTS");
        assert_eq!(
            ctx.rollback_to_savepoint("b").unwrap_err().code(),
            "SAVEPOINT_NOT_FOUND"
        );
    }

    #[test]
    fn test_operations_rejected_after_finish() {
        let mut ctx = context();
        ctx.transition(TransactionState::Committing, "commit").unwrap();
        ctx.transition(TransactionState::Committed, "commit").unwrap();
        assert_eq!(
            ctx.log_operation(Operation::new("insert")).unwrap_err().code(),
            "INVALID_TRANSACTION_STATE"
        );
    }
}
