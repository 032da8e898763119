use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::TxnId;

/// Messages broadcast to participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantAction {
    Prepare,
    Commit,
    Abort,
}

impl fmt::Display for ParticipantAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantAction::Prepare => write!(f, "PREPARE"),
            ParticipantAction::Commit => write!(f, "COMMIT"),
            ParticipantAction::Abort => write!(f, "ABORT"),
        }
    }
}

/// A participant's answer in the voting phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Yes,
    No,
}

/// Transport to the participants of distributed transactions.
///
/// Delivery guarantees, retries inside a single call and addressing are the
/// channel's business; the coordinator only decides what to send and when.
#[async_trait]
pub trait ParticipantChannel: Send + Sync {
    async fn notify(&self, participant: &str, action: ParticipantAction, txn_id: TxnId) -> Result<()>;

    async fn collect_vote(&self, participant: &str, txn_id: TxnId) -> Result<Vote>;
}
