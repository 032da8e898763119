//! In-memory collaborators
//!
//! Reference implementations of the resource provider, audit sink and
//! participant channel. They keep counters and accept injected faults so the
//! coordinator can be exercised end to end without a real store or network.
//! The simulated channel answers YES for every participant unless told otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{CoordinatorError, Result};
use crate::protocol::{ParticipantAction, ParticipantChannel, Vote};
use crate::provider::{Connection, ResourceProvider, Session};
use crate::types::{SessionTxnOptions, TxnId};

// ============== Resource provider ==============

/// Points where a memory connection can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    StartSession,
    StartTransaction,
    Commit,
    Abort,
    EndSession,
}

/// Counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub sessions_started: usize,
    pub transactions_started: usize,
    pub commits: usize,
    pub aborts: usize,
    pub sessions_ended: usize,
}

#[derive(Default)]
struct ConnectionState {
    sessions_started: AtomicUsize,
    transactions_started: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
    sessions_ended: AtomicUsize,
    faults: Mutex<HashSet<Fault>>,
    latency_ms: AtomicU64,
    last_options: Mutex<Option<SessionTxnOptions>>,
}

impl ConnectionState {
    fn check(&self, fault: Fault) -> Result<()> {
        let faults = self.faults.lock().expect("faults lock poisoned");
        if faults.contains(&fault) {
            return Err(CoordinatorError::Resource(format!("injected {:?} failure", fault)));
        }
        Ok(())
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// A named in-memory connection
pub struct MemoryConnection {
    name: String,
    state: Arc<ConnectionState>,
}

impl MemoryConnection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(ConnectionState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            sessions_started: self.state.sessions_started.load(Ordering::SeqCst),
            transactions_started: self.state.transactions_started.load(Ordering::SeqCst),
            commits: self.state.commits.load(Ordering::SeqCst),
            aborts: self.state.aborts.load(Ordering::SeqCst),
            sessions_ended: self.state.sessions_ended.load(Ordering::SeqCst),
        }
    }

    /// Options of the most recently opened transaction
    pub fn last_options(&self) -> Option<SessionTxnOptions> {
        *self.state.last_options.lock().expect("options lock poisoned")
    }

    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        let mut faults = self.state.faults.lock().expect("faults lock poisoned");
        if enabled {
            faults.insert(fault);
        } else {
            faults.remove(&fault);
        }
    }

    /// Delay every session call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn start_session(&self) -> Result<Box<dyn Session>> {
        self.state.check(Fault::StartSession)?;
        self.state.sessions_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            in_transaction: false,
            ended: false,
        }))
    }
}

struct MemorySession {
    state: Arc<ConnectionState>,
    in_transaction: bool,
    ended: bool,
}

#[async_trait]
impl Session for MemorySession {
    async fn start_transaction(&mut self, options: SessionTxnOptions) -> Result<()> {
        self.state.delay().await;
        self.state.check(Fault::StartTransaction)?;
        if self.in_transaction {
            return Err(CoordinatorError::Resource("transaction already open".into()));
        }
        *self.state.last_options.lock().expect("options lock poisoned") = Some(options);
        self.state.transactions_started.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.state.delay().await;
        self.state.check(Fault::Commit)?;
        if !self.in_transaction {
            return Err(CoordinatorError::Resource("no open transaction to commit".into()));
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = false;
        Ok(())
    }

    async fn abort_transaction(&mut self) -> Result<()> {
        self.state.delay().await;
        self.state.check(Fault::Abort)?;
        if !self.in_transaction {
            return Err(CoordinatorError::Resource("no open transaction to abort".into()));
        }
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = false;
        Ok(())
    }

    async fn end_session(&mut self) -> Result<()> {
        self.state.check(Fault::EndSession)?;
        if !self.ended {
            self.ended = true;
            self.state.sessions_ended.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Resource provider backed by named in-memory connections
#[derive(Default)]
pub struct MemoryProvider {
    connections: RwLock<HashMap<String, Arc<MemoryConnection>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with a single connection called `name`
    pub fn with_connection(name: &str) -> Self {
        let provider = Self::new();
        provider.add_connection(name);
        provider
    }

    pub fn add_connection(&self, name: &str) -> Arc<MemoryConnection> {
        let conn = Arc::new(MemoryConnection::new(name));
        self.connections
            .write()
            .expect("connections lock poisoned")
            .insert(name.to_string(), Arc::clone(&conn));
        conn
    }

    /// Take a connection down; later lookups find nothing
    pub fn remove_connection(&self, name: &str) -> Option<Arc<MemoryConnection>> {
        self.connections
            .write()
            .expect("connections lock poisoned")
            .remove(name)
    }

    pub fn connection(&self, name: &str) -> Option<Arc<MemoryConnection>> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    async fn get_connection(&self, name: &str) -> Option<Arc<dyn Connection>> {
        self.connection(name).map(|c| c as Arc<dyn Connection>)
    }
}

// ============== Audit sink ==============

/// Audit sink that keeps every event in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit events lock poisoned").clone()
    }

    pub fn actions_for(&self, id: TxnId) -> Vec<AuditAction> {
        self.events
            .lock()
            .expect("audit events lock poisoned")
            .iter()
            .filter(|e| e.details.transaction_id == id)
            .map(|e| e.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_activity(&self, event: AuditEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Audit("audit store unavailable".into()));
        }
        self.events
            .lock()
            .expect("audit events lock poisoned")
            .push(event);
        Ok(())
    }
}

// ============== Participant channel ==============

/// How a simulated participant answers vote requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteBehavior {
    Answer(Vote),
    /// Channel error on every request
    Fail,
    /// Channel error for the next `n` requests, then YES
    FailTimes(usize),
    /// Never answers
    Hang,
}

/// A notification the simulated channel delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub participant: String,
    pub action: ParticipantAction,
    pub txn_id: TxnId,
}

/// Participant channel that records traffic and answers with scripted votes
#[derive(Default)]
pub struct SimulatedChannel {
    behaviors: Mutex<HashMap<String, VoteBehavior>>,
    unreachable: Mutex<HashSet<String>>,
    notifications: Mutex<Vec<Notification>>,
    vote_requests: Mutex<HashMap<String, usize>>,
}

impl SimulatedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_vote(&self, participant: &str, vote: Vote) {
        self.set_behavior(participant, VoteBehavior::Answer(vote));
    }

    pub fn set_behavior(&self, participant: &str, behavior: VoteBehavior) {
        self.behaviors
            .lock()
            .expect("behaviors lock poisoned")
            .insert(participant.to_string(), behavior);
    }

    /// Make notifications to `participant` fail
    pub fn set_unreachable(&self, participant: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().expect("unreachable lock poisoned");
        if unreachable {
            set.insert(participant.to_string());
        } else {
            set.remove(participant);
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .expect("notifications lock poisoned")
            .clone()
    }

    /// Actions delivered to `participant` for `txn_id`, in order
    pub fn received(&self, participant: &str, txn_id: TxnId) -> Vec<ParticipantAction> {
        self.notifications
            .lock()
            .expect("notifications lock poisoned")
            .iter()
            .filter(|n| n.participant == participant && n.txn_id == txn_id)
            .map(|n| n.action)
            .collect()
    }

    pub fn vote_requests(&self, participant: &str) -> usize {
        self.vote_requests
            .lock()
            .expect("vote requests lock poisoned")
            .get(participant)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ParticipantChannel for SimulatedChannel {
    async fn notify(&self, participant: &str, action: ParticipantAction, txn_id: TxnId) -> Result<()> {
        if self
            .unreachable
            .lock()
            .expect("unreachable lock poisoned")
            .contains(participant)
        {
            return Err(CoordinatorError::Participant {
                participant: participant.to_string(),
                detail: "unreachable".into(),
            });
        }
        self.notifications
            .lock()
            .expect("notifications lock poisoned")
            .push(Notification {
                participant: participant.to_string(),
                action,
                txn_id,
            });
        Ok(())
    }

    async fn collect_vote(&self, participant: &str, _txn_id: TxnId) -> Result<Vote> {
        *self
            .vote_requests
            .lock()
            .expect("vote requests lock poisoned")
            .entry(participant.to_string())
            .or_insert(0) += 1;

        let behavior = {
            let mut behaviors = self.behaviors.lock().expect("behaviors lock poisoned");
            let current = behaviors
                .get(participant)
                .copied()
                .unwrap_or(VoteBehavior::Answer(Vote::Yes));
            if let VoteBehavior::FailTimes(n) = current {
                let next = if n <= 1 {
                    VoteBehavior::Answer(Vote::Yes)
                } else {
                    VoteBehavior::FailTimes(n - 1)
                };
                behaviors.insert(participant.to_string(), next);
            }
            current
        };

        match behavior {
            VoteBehavior::Answer(vote) => Ok(vote),
            VoteBehavior::Fail | VoteBehavior::FailTimes(_) => Err(CoordinatorError::Participant {
                participant: participant.to_string(),
                detail: "vote request failed".into(),
            }),
            VoteBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(Vote::No)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IsolationLevel;

    #[tokio::test]
    async fn test_memory_session_lifecycle() {
        let provider = MemoryProvider::with_connection("db");
        let conn = provider.get_connection("db").await.unwrap();
        let mut session = conn.start_session().await.unwrap();

        session
            .start_transaction(IsolationLevel::Snapshot.session_options())
            .await
            .unwrap();
        assert!(session.in_transaction());
        session.commit_transaction().await.unwrap();
        assert!(!session.in_transaction());
        session.end_session().await.unwrap();
        session.end_session().await.unwrap();

        let stats = provider.connection("db").unwrap().stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.sessions_ended, 1);
        assert_eq!(
            provider.connection("db").unwrap().last_options().unwrap().isolation_level,
            IsolationLevel::Snapshot
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let provider = MemoryProvider::with_connection("db");
        let handle = provider.connection("db").unwrap();
        handle.set_fault(Fault::Commit, true);

        let conn = provider.get_connection("db").await.unwrap();
        let mut session = conn.start_session().await.unwrap();
        session
            .start_transaction(IsolationLevel::ReadCommitted.session_options())
            .await
            .unwrap();
        assert!(session.commit_transaction().await.is_err());
        assert!(session.in_transaction());
        session.abort_transaction().await.unwrap();

        assert!(provider.remove_connection("db").is_some());
        assert!(provider.get_connection("db").await.is_none());
    }

    #[tokio::test]
    async fn test_simulated_channel_scripts() {
        let channel = SimulatedChannel::new();
        assert_eq!(channel.collect_vote("a", TxnId(1)).await.unwrap(), Vote::Yes);

        channel.set_vote("b", Vote::No);
        assert_eq!(channel.collect_vote("b", TxnId(1)).await.unwrap(), Vote::No);

        channel.set_behavior("c", VoteBehavior::FailTimes(2));
        assert!(channel.collect_vote("c", TxnId(1)).await.is_err());
        assert!(channel.collect_vote("c", TxnId(1)).await.is_err());
        assert_eq!(channel.collect_vote("c", TxnId(1)).await.unwrap(), Vote::Yes);
        assert_eq!(channel.vote_requests("c"), 3);

        channel.set_unreachable("a", true);
        assert!(channel.notify("a", ParticipantAction::Prepare, TxnId(1)).await.is_err());
        channel.notify("b", ParticipantAction::Prepare, TxnId(1)).await.unwrap();
        assert_eq!(channel.received("b", TxnId(1)), vec![ParticipantAction::Prepare]);
    }

    #[tokio::test]
    async fn test_audit_sink_failure_toggle() {
        let sink = MemoryAuditSink::new();
        sink.set_failing(true);
        let event = AuditEvent {
            action: AuditAction::TransactionStarted,
            category: crate::audit::AUDIT_CATEGORY.to_string(),
            details: crate::audit::AuditDetails {
                transaction_id: TxnId(1),
                state: crate::types::TransactionState::InProgress,
                distributed: false,
                operation_count: 0,
                duration_ms: None,
                reason: None,
            },
            metadata: Default::default(),
        };
        assert!(sink.log_activity(event.clone()).await.is_err());
        sink.set_failing(false);
        sink.log_activity(event).await.unwrap();
        assert_eq!(sink.actions_for(TxnId(1)), vec![AuditAction::TransactionStarted]);
    }
}
