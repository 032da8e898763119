//! Error types for the transaction coordinator
//!
//! Every failure a caller can observe carries an [`ErrorKind`] whose
//! [`ErrorKind::code`] is the stable string clients match on (`"NO_CONNECTION"`,
//! `"SAVEPOINT_EXISTS"`, ...). Failures coming from collaborators (the resource
//! provider, participants, the audit sink, the decision log) are *unrecognized*:
//! they are wrapped exactly once into the `*_ERROR` kind of the operation that hit
//! them, keeping the original message as the detail.

use std::io;

use thiserror::Error;

use crate::types::{TransactionState, TxnId};

/// Boxed error returned by `with_transaction` callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable error kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoConnection,
    TransactionNotFound,
    InvalidTransactionState,
    TransactionStartError,
    TransactionCommitError,
    TransactionAbortError,
    MissingSavepointName,
    SavepointExists,
    SavepointNotFound,
    LockAcquireError,
    DistributedTxnNotFound,
    DistributedTxnAborted,
    TransactionExecutionError,
    /// Raw collaborator failure that has not been wrapped yet
    Internal,
}

impl ErrorKind {
    /// The wire/log code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NoConnection => "NO_CONNECTION",
            ErrorKind::TransactionNotFound => "TRANSACTION_NOT_FOUND",
            ErrorKind::InvalidTransactionState => "INVALID_TRANSACTION_STATE",
            ErrorKind::TransactionStartError => "TRANSACTION_START_ERROR",
            ErrorKind::TransactionCommitError => "TRANSACTION_COMMIT_ERROR",
            ErrorKind::TransactionAbortError => "TRANSACTION_ABORT_ERROR",
            ErrorKind::MissingSavepointName => "MISSING_SAVEPOINT_NAME",
            ErrorKind::SavepointExists => "SAVEPOINT_EXISTS",
            ErrorKind::SavepointNotFound => "SAVEPOINT_NOT_FOUND",
            ErrorKind::LockAcquireError => "LOCK_ACQUIRE_ERROR",
            ErrorKind::DistributedTxnNotFound => "DISTRIBUTED_TXN_NOT_FOUND",
            ErrorKind::DistributedTxnAborted => "DISTRIBUTED_TXN_ABORTED",
            ErrorKind::TransactionExecutionError => "TRANSACTION_EXECUTION_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Unified error type for coordinator operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("No connection available for '{0}'")]
    NoConnection(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(TxnId),

    #[error("Transaction {id} is {actual}, cannot {operation}")]
    InvalidState {
        id: TxnId,
        actual: TransactionState,
        operation: &'static str,
    },

    #[error("Failed to start transaction: {detail}")]
    StartFailed { detail: String },

    #[error("Failed to commit transaction {id}: {detail}")]
    CommitFailed { id: TxnId, detail: String },

    #[error("Failed to abort transaction {id}: {detail}")]
    AbortFailed { id: TxnId, detail: String },

    #[error("Savepoint name is required")]
    MissingSavepointName,

    #[error("Savepoint '{name}' already exists in transaction {id}")]
    SavepointExists { id: TxnId, name: String },

    #[error("Savepoint '{name}' not found in transaction {id}")]
    SavepointNotFound { id: TxnId, name: String },

    #[error("Failed to acquire lock on '{resource}' for transaction {id}: {detail}")]
    LockAcquire {
        id: TxnId,
        resource: String,
        detail: String,
    },

    #[error("Distributed transaction {0} not found")]
    DistributedTxnNotFound(TxnId),

    #[error("Distributed transaction {id} aborted: {reason}")]
    DistributedTxnAborted { id: TxnId, reason: String },

    #[error("Transaction {id} failed during execution: {detail}")]
    Execution { id: TxnId, detail: String },

    #[error("Resource provider error: {0}")]
    Resource(String),

    #[error("Participant '{participant}' error: {detail}")]
    Participant { participant: String, detail: String },

    #[error("Audit sink error: {0}")]
    Audit(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decision log encoding error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Get the stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::NoConnection(_) => ErrorKind::NoConnection,
            CoordinatorError::TransactionNotFound(_) => ErrorKind::TransactionNotFound,
            CoordinatorError::InvalidState { .. } => ErrorKind::InvalidTransactionState,
            CoordinatorError::StartFailed { .. } => ErrorKind::TransactionStartError,
            CoordinatorError::CommitFailed { .. } => ErrorKind::TransactionCommitError,
            CoordinatorError::AbortFailed { .. } => ErrorKind::TransactionAbortError,
            CoordinatorError::MissingSavepointName => ErrorKind::MissingSavepointName,
            CoordinatorError::SavepointExists { .. } => ErrorKind::SavepointExists,
            CoordinatorError::SavepointNotFound { .. } => ErrorKind::SavepointNotFound,
            CoordinatorError::LockAcquire { .. } => ErrorKind::LockAcquireError,
            CoordinatorError::DistributedTxnNotFound(_) => ErrorKind::DistributedTxnNotFound,
            CoordinatorError::DistributedTxnAborted { .. } => ErrorKind::DistributedTxnAborted,
            CoordinatorError::Execution { .. } => ErrorKind::TransactionExecutionError,
            CoordinatorError::Resource(_)
            | CoordinatorError::Participant { .. }
            | CoordinatorError::Audit(_)
            | CoordinatorError::Io(_)
            | CoordinatorError::Codec(_)
            | CoordinatorError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for `self.kind().code()`
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// True for errors that already carry a domain kind and must be surfaced verbatim
    pub fn is_recognized(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }

    /// Wrap an unrecognized error as a commit failure; recognized errors pass through.
    pub(crate) fn into_commit_error(self, id: TxnId) -> Self {
        if self.is_recognized() {
            self
        } else {
            CoordinatorError::CommitFailed {
                id,
                detail: self.to_string(),
            }
        }
    }

    /// Wrap an unrecognized error as an abort failure; recognized errors pass through.
    pub(crate) fn into_abort_error(self, id: TxnId) -> Self {
        if self.is_recognized() {
            self
        } else {
            CoordinatorError::AbortFailed {
                id,
                detail: self.to_string(),
            }
        }
    }

    /// Wrap an unrecognized error as a start failure; recognized errors pass through.
    pub(crate) fn into_start_error(self) -> Self {
        if self.is_recognized() {
            self
        } else {
            CoordinatorError::StartFailed {
                detail: self.to_string(),
            }
        }
    }

    /// Resolve a `with_transaction` callback error.
    ///
    /// A boxed `CoordinatorError` with a domain kind is returned unchanged, anything
    /// else becomes `TRANSACTION_EXECUTION_ERROR`.
    pub(crate) fn from_callback(id: TxnId, err: BoxError) -> Self {
        match err.downcast::<CoordinatorError>() {
            Ok(inner) if inner.is_recognized() => *inner,
            Ok(inner) => CoordinatorError::Execution {
                id,
                detail: inner.to_string(),
            },
            Err(other) => CoordinatorError::Execution {
                id,
                detail: other.to_string(),
            },
        }
    }
}

impl From<bincode::Error> for CoordinatorError {
    fn from(e: bincode::Error) -> Self {
        CoordinatorError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::Config(e.to_string())
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_taxonomy() {
        assert_eq!(
            CoordinatorError::NoConnection("db".into()).code(),
            "NO_CONNECTION"
        );
        assert_eq!(
            CoordinatorError::TransactionNotFound(TxnId(7)).code(),
            "TRANSACTION_NOT_FOUND"
        );
        assert_eq!(
            CoordinatorError::DistributedTxnAborted {
                id: TxnId(1),
                reason: "no".into()
            }
            .code(),
            "DISTRIBUTED_TXN_ABORTED"
        );
        assert_eq!(CoordinatorError::Resource("boom".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_wrapping_happens_once() {
        let raw = CoordinatorError::Resource("disk on fire".into());
        let wrapped = raw.into_commit_error(TxnId(3));
        assert_eq!(wrapped.kind(), ErrorKind::TransactionCommitError);
        assert!(wrapped.to_string().contains("disk on fire"));

        // A second wrap leaves the already-recognized error alone
        let again = wrapped.into_abort_error(TxnId(3));
        assert_eq!(again.kind(), ErrorKind::TransactionCommitError);
    }

    #[test]
    fn test_callback_errors() {
        let recognized: BoxError = Box::new(CoordinatorError::SavepointNotFound {
            id: TxnId(1),
            name: "a".into(),
        });
        assert_eq!(
            CoordinatorError::from_callback(TxnId(1), recognized).kind(),
            ErrorKind::SavepointNotFound
        );

        let foreign: BoxError = "validation failed".into();
        let err = CoordinatorError::from_callback(TxnId(1), foreign);
        assert_eq!(err.kind(), ErrorKind::TransactionExecutionError);
        assert!(err.to_string().contains("validation failed"));
    }
}
