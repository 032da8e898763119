//! Audit events for transaction lifecycle transitions
//!
//! Auditing is strictly best-effort: the coordinator bounds every sink write with
//! a timeout and only logs failures, so a broken sink can never fail or stall a
//! commit or abort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Metadata, TransactionState, TxnId};

/// Category attached to every event emitted by the coordinator
pub const AUDIT_CATEGORY: &str = "transaction";

/// Lifecycle actions that get audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    TransactionStarted,
    TransactionCommitted,
    TransactionAborted,
    TransactionFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::TransactionStarted => "TRANSACTION_STARTED",
            AuditAction::TransactionCommitted => "TRANSACTION_COMMITTED",
            AuditAction::TransactionAborted => "TRANSACTION_ABORTED",
            AuditAction::TransactionFailed => "TRANSACTION_FAILED",
        }
    }
}

/// Transaction facts carried by an audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDetails {
    pub transaction_id: TxnId,
    pub state: TransactionState,
    pub distributed: bool,
    pub operation_count: usize,
    pub duration_ms: Option<u64>,
    pub reason: Option<String>,
}

/// One structured audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub category: String,
    pub details: AuditDetails,
    pub metadata: Metadata,
}

/// Receives lifecycle events for compliance logging
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_activity(&self, event: AuditEvent) -> Result<()>;
}

/// Sink that renders events as JSON through the `log` facade
#[derive(Debug, Default, Clone)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn log_activity(&self, event: AuditEvent) -> Result<()> {
        let rendered = serde_json::to_string(&event)?;
        log::info!(target: "minitxn::audit", "{}", rendered);
        Ok(())
    }
}

/// Deliver an event, swallowing (and logging) failures and timeouts
pub(crate) async fn emit(sink: &Arc<dyn AuditSink>, event: AuditEvent, timeout: Duration) {
    let action = event.action;
    let id = event.details.transaction_id;
    match tokio::time::timeout(timeout, sink.log_activity(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::warn!("Audit sink rejected {} for {}: {}", action.as_str(), id, e);
        }
        Err(_) => {
            log::warn!(
                "Audit sink timed out after {:?} writing {} for {}",
                timeout,
                action.as_str(),
                id
            );
        }
    }
}
