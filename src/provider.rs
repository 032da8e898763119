use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::SessionTxnOptions;

/// Supplies connections to the transactional store.
///
/// The coordinator never talks to the store directly; it asks the provider for a
/// named connection, opens a session on it and drives that session's transaction.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Look up a live connection. `None` means the name is unknown or the
    /// connection is down.
    async fn get_connection(&self, name: &str) -> Option<Arc<dyn Connection>>;
}

/// A live connection able to hand out sessions
#[async_trait]
pub trait Connection: Send + Sync {
    async fn start_session(&self) -> Result<Box<dyn Session>>;
}

/// A session owned by exactly one transaction context
#[async_trait]
pub trait Session: Send + Sync {
    /// Open the underlying transaction
    async fn start_transaction(&mut self, options: SessionTxnOptions) -> Result<()>;

    async fn commit_transaction(&mut self) -> Result<()>;

    async fn abort_transaction(&mut self) -> Result<()>;

    /// Release the session. Called once, after commit or abort.
    async fn end_session(&mut self) -> Result<()>;

    /// Whether an underlying transaction is currently open
    fn in_transaction(&self) -> bool;
}
