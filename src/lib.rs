//! MiniTxn - a transaction coordinator
//!
//! Drives transactions over pluggable storage connections:
//! - a lifecycle state machine with per-transaction operation logs
//! - savepoints and advisory locks
//! - two-phase commit across named participants, with an optional decision log
//! - audit events, bounded history, expiry sweeps and metrics
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Callers                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TransactionCoordinator                      │
//! │   (active registry, history, sweeper, metrics, handles)     │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                      │
//!          ▼                   ▼                      ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌──────────────────────┐
//! │ TransactionCtx  │ │ DistributedProto │ │      AuditSink       │
//! │ (ops, savepts,  │ │ (2PC, votes,     │ │ (best-effort events) │
//! │  locks)         │ │  decision log)   │ │                      │
//! └─────────────────┘ └──────────────────┘ └──────────────────────┘
//!          │                   │
//!          ▼                   ▼
//! ┌─────────────────┐ ┌──────────────────┐
//! │ResourceProvider │ │ParticipantChannel│
//! │ (sessions)      │ │ (PREPARE/COMMIT) │
//! └─────────────────┘ └──────────────────┘

pub mod audit;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod memory;
pub mod protocol;
pub mod provider;
pub mod savepoint;
pub mod types;

pub use audit::{AuditAction, AuditEvent, AuditSink, LogAuditSink};
pub use config::{CoordinatorConfig, ParticipantFailurePolicy};
pub use coordinator::{CoordinatorBuilder, TransactionCoordinator, TransactionHandle};
pub use error::{BoxError, CoordinatorError, ErrorKind, Result};
pub use lock::{Lock, LockOptions, LockType};
pub use protocol::{DistributedTransaction, ParticipantAction, ParticipantChannel, Phase, RecoverySummary, Vote};
pub use provider::{Connection, ResourceProvider, Session};
pub use types::{
    AbortOptions, AbortOutcome, CleanupReport, CommitOptions, CommitOutcome, IsolationLevel,
    Metrics, Operation, RollbackOutcome, SavepointInfo, StartOptions, TransactionFilter,
    TransactionState, TransactionStatus, TxnId,
};
