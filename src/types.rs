//! Core value types shared by the coordinator, its collaborators and callers

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form metadata attached to transactions and audit events
pub type Metadata = Map<String, Value>;

/// Process-unique transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Get current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Transaction lifecycle state
///
/// ```text
/// PENDING     -> IN_PROGRESS | FAILED
/// IN_PROGRESS -> COMMITTING | ABORTING
/// COMMITTING  -> COMMITTED | ABORTING | FAILED
/// ABORTING    -> ABORTED | FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Pending,
    InProgress,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Failed,
}

impl TransactionState {
    /// All states, in lifecycle order
    pub const ALL: [TransactionState; 7] = [
        TransactionState::Pending,
        TransactionState::InProgress,
        TransactionState::Committing,
        TransactionState::Committed,
        TransactionState::Aborting,
        TransactionState::Aborted,
        TransactionState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "PENDING",
            TransactionState::InProgress => "IN_PROGRESS",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborting => "ABORTING",
            TransactionState::Aborted => "ABORTED",
            TransactionState::Failed => "FAILED",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Failed
        )
    }

    /// Check whether `next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Committing)
                | (InProgress, Aborting)
                | (Committing, Committed)
                | (Committing, Aborting)
                | (Committing, Failed)
                | (Aborting, Aborted)
                | (Aborting, Failed)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl IsolationLevel {
    /// Map the isolation level onto the options the underlying session understands
    pub fn session_options(&self) -> SessionTxnOptions {
        let (read_concern, write_concern) = match self {
            IsolationLevel::ReadUncommitted => (ReadConcern::Local, WriteConcern::Acknowledged),
            IsolationLevel::ReadCommitted => (ReadConcern::Majority, WriteConcern::Majority),
            IsolationLevel::RepeatableRead
            | IsolationLevel::Serializable
            | IsolationLevel::Snapshot => (ReadConcern::Snapshot, WriteConcern::Majority),
        };
        SessionTxnOptions {
            isolation_level: *self,
            read_concern,
            write_concern,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().replace('-', "_").as_str() {
            "READ_UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Some(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            "SNAPSHOT" => Some(IsolationLevel::Snapshot),
            _ => None,
        }
    }
}

/// Read guarantee requested from the underlying store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConcern {
    Local,
    Majority,
    Snapshot,
}

/// Write acknowledgement requested from the underlying store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteConcern {
    Acknowledged,
    Majority,
}

/// Options passed to `Session::start_transaction`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTxnOptions {
    pub isolation_level: IsolationLevel,
    pub read_concern: ReadConcern,
    pub write_concern: WriteConcern,
}

/// An operation reported by the caller for observability and savepoint truncation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation type, e.g. "insert" or "update"
    #[serde(rename = "type")]
    pub op_type: String,
    /// Anything else the caller wants recorded
    #[serde(default)]
    pub details: Value,
}

impl Operation {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(op_type: impl Into<String>, details: Value) -> Self {
        Self {
            op_type: op_type.into(),
            details,
        }
    }
}

/// An entry in a transaction's append-only operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Position in the log (0-based)
    pub seq: usize,
    /// Unix epoch millis
    pub timestamp: u64,
    #[serde(flatten)]
    pub operation: Operation,
}

/// Options for `start_transaction`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Named connection; falls back to the configured default
    pub connection: Option<String>,
    /// Falls back to the configured default isolation
    pub isolation_level: Option<IsolationLevel>,
    pub distributed: bool,
    pub participants: Vec<String>,
    pub metadata: Metadata,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(mut self, name: impl Into<String>) -> Self {
        self.connection = Some(name.into());
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Mark the transaction distributed across the given participants
    pub fn distributed<I, S>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distributed = true;
        self.participants = participants.into_iter().map(Into::into).collect();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Options for `commit_transaction`
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Extra metadata merged into the context before the audit event
    pub metadata: Metadata,
}

/// Options for `abort_transaction`
#[derive(Debug, Clone, Default)]
pub struct AbortOptions {
    pub reason: Option<String>,
}

impl AbortOptions {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub id: TxnId,
    pub state: TransactionState,
    pub duration_ms: u64,
    pub operation_count: usize,
}

/// Result of an abort (including the idempotent no-op case)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortOutcome {
    pub id: TxnId,
    pub state: TransactionState,
    pub reason: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Result of `create_savepoint`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavepointInfo {
    pub id: TxnId,
    pub name: String,
    pub operation_count: usize,
}

/// Result of `rollback_to_savepoint`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub id: TxnId,
    pub name: String,
    pub operations_removed: usize,
    /// Savepoints invalidated by the rollback
    pub savepoints_removed: Vec<String>,
}

/// Point-in-time view of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub id: TxnId,
    pub state: TransactionState,
    /// Every state the transaction has been in, oldest first
    pub state_history: Vec<TransactionState>,
    pub connection: String,
    pub isolation_level: IsolationLevel,
    pub distributed: bool,
    pub participants: Vec<String>,
    pub operation_count: usize,
    pub savepoints: Vec<String>,
    pub locks: Vec<String>,
    /// Unix epoch millis
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub duration_ms: Option<u64>,
    pub abort_reason: Option<String>,
    pub metadata: Metadata,
}

/// Filters for `list_active_transactions`; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub state: Option<TransactionState>,
    pub distributed: Option<bool>,
    pub connection: Option<String>,
    /// Only transactions at least this old
    pub min_age: Option<Duration>,
}

impl TransactionFilter {
    pub fn matches(&self, status: &TransactionStatus, age: Duration) -> bool {
        if let Some(state) = self.state {
            if status.state != state {
                return false;
            }
        }
        if let Some(distributed) = self.distributed {
            if status.distributed != distributed {
                return false;
            }
        }
        if let Some(connection) = &self.connection {
            if &status.connection != connection {
                return false;
            }
        }
        match self.min_age {
            Some(min_age) => age >= min_age,
            None => true,
        }
    }
}

/// Aggregate counters over the active and history registries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub active_transactions: usize,
    pub historical_transactions: usize,
    pub total_transactions: usize,
    pub distributed_transactions: usize,
    pub transactions_by_state: BTreeMap<TransactionState, usize>,
    /// Mean duration over transactions that have finished, 0 when none have
    pub average_duration_ms: f64,
}

/// Result of a cleanup sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_count: usize,
    pub cleaned_count: usize,
    /// Expired transactions left for the next sweep because an operation on them
    /// was still running; included in `expired_count`
    pub skipped_count: usize,
    pub active_transactions: usize,
    pub history_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for from in TransactionState::ALL {
            if from.is_terminal() {
                for to in TransactionState::ALL {
                    assert!(!from.can_transition_to(to), "{} -> {}", from, to);
                }
            }
        }
    }

    #[test]
    fn test_happy_paths_are_edges() {
        use TransactionState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Committing));
        assert!(Committing.can_transition_to(Committed));
        assert!(InProgress.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(Aborted));
        assert!(!InProgress.can_transition_to(Committed));
        assert!(!Pending.can_transition_to(Committing));
    }

    #[test]
    fn test_isolation_mapping() {
        let opts = IsolationLevel::Snapshot.session_options();
        assert_eq!(opts.read_concern, ReadConcern::Snapshot);
        assert_eq!(opts.write_concern, WriteConcern::Majority);

        let opts = IsolationLevel::ReadUncommitted.session_options();
        assert_eq!(opts.read_concern, ReadConcern::Local);
        assert_eq!(IsolationLevel::from_name("repeatable-read"), Some(IsolationLevel::RepeatableRead));
        assert_eq!(IsolationLevel::from_name("chaos"), None);
    }

    #[test]
    fn test_state_serializes_as_code() {
        let json = serde_json::to_string(&TransactionState::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }
}
