//! Two-phase commit across the participants of a distributed transaction
//!
//! ## Phases
//!
//! ```text
//! preparing --commit--> voting --all YES--> committing --> committed
//!     |                   |
//!     |                   +--any NO--> (DISTRIBUTED_TXN_ABORTED, record kept)
//!     +--------abort-----------------> aborting --> aborted (record removed)
//! ```
//!
//! 1. START: a record is created in `preparing` and PREPARE is sent to every
//!    participant. Delivery failures are logged only.
//! 2. COMMIT: one vote is collected per participant, in order. A missing vote is
//!    handled by the configured [`ParticipantFailurePolicy`]. Only a unanimous
//!    YES moves to `committing`, after which COMMIT goes to everybody.
//! 3. ABORT: ABORT goes to everybody and the record is dropped.
//!
//! With a decision log configured, the decision is made durable before the
//! COMMIT/ABORT broadcast starts so a restarted coordinator can finish it. The
//! log is emptied whenever the last in-flight record is dropped, and rewritten
//! down to the in-flight trails once it outgrows its threshold.

pub mod channel;
pub mod decision_log;

pub use channel::{ParticipantAction, ParticipantChannel, Vote};
pub use decision_log::{Decision, DecisionKind, DecisionLog, DecisionRecord, InDoubt, RecoveryReport};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ParticipantFailurePolicy;
use crate::error::{CoordinatorError, Result};
use crate::types::{now_millis, TxnId};

/// Protocol phase of a distributed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Preparing,
    Voting,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Preparing => "preparing",
            Phase::Voting => "voting",
            Phase::Committing => "committing",
            Phase::Committed => "committed",
            Phase::Aborting => "aborting",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Protocol-side record of a distributed transaction, keyed by the context id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTransaction {
    pub id: TxnId,
    /// Node driving the protocol
    pub coordinator: String,
    pub participants: Vec<String>,
    pub votes: BTreeMap<String, Vote>,
    pub phase: Phase,
    /// Unix epoch millis
    pub created_at: u64,
}

/// Summary of `DistributedProtocol::recover`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub committed: Vec<TxnId>,
    pub aborted: Vec<TxnId>,
}

/// The two-phase-commit driver
pub struct DistributedProtocol {
    coordinator_id: String,
    channel: Arc<dyn ParticipantChannel>,
    policy: ParticipantFailurePolicy,
    vote_timeout: Duration,
    decision_log: Option<Arc<DecisionLog>>,
    records: RwLock<HashMap<TxnId, DistributedTransaction>>,
}

impl DistributedProtocol {
    pub fn new(
        coordinator_id: impl Into<String>,
        channel: Arc<dyn ParticipantChannel>,
        policy: ParticipantFailurePolicy,
        vote_timeout: Duration,
        decision_log: Option<Arc<DecisionLog>>,
    ) -> Self {
        Self {
            coordinator_id: coordinator_id.into(),
            channel,
            policy,
            vote_timeout,
            decision_log,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of a record
    pub fn get(&self, id: TxnId) -> Option<DistributedTransaction> {
        self.records
            .read()
            .expect("distributed records lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Number of records currently tracked
    pub fn len(&self) -> usize {
        self.records.read().expect("distributed records lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_phase(&self, id: TxnId, phase: Phase) -> Result<Vec<String>> {
        let mut records = self.records.write().expect("distributed records lock poisoned");
        let record = records
            .get_mut(&id)
            .ok_or(CoordinatorError::DistributedTxnNotFound(id))?;
        log::debug!("{}: 2PC {} -> {}", id, record.phase, phase);
        record.phase = phase;
        Ok(record.participants.clone())
    }

    fn record_vote(&self, id: TxnId, participant: &str, vote: Vote) {
        let mut records = self.records.write().expect("distributed records lock poisoned");
        if let Some(record) = records.get_mut(&id) {
            record.votes.insert(participant.to_string(), vote);
        }
    }

    /// Drop a record and compact the decision log if it allows
    fn remove(&self, id: TxnId) -> Option<DistributedTransaction> {
        let mut records = self.records.write().expect("distributed records lock poisoned");
        let removed = records.remove(&id);
        self.compact_locked(&records);
        removed
    }

    /// Truncate the decision log when nothing is in flight, or rewrite it down to
    /// the in-flight trails when it has outgrown its threshold. Returns whether
    /// the log was compacted.
    pub fn compact(&self) -> bool {
        let records = self.records.write().expect("distributed records lock poisoned");
        self.compact_locked(&records)
    }

    /// Callers hold the records write lock. Every append happens either under
    /// that lock or while the appending transaction's record is in the map, so
    /// the map covers every trail the log still needs.
    fn compact_locked(&self, records: &HashMap<TxnId, DistributedTransaction>) -> bool {
        let Some(log) = &self.decision_log else {
            return false;
        };
        let result = if records.is_empty() {
            log.truncate()
        } else {
            match log.needs_rewrite() {
                Ok(true) => log.rewrite(live_trails(records)),
                Ok(false) => return false,
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to compact decision log: {}", e);
                false
            }
        }
    }

    fn log_decision(&self, id: TxnId, kind: DecisionKind) -> Result<()> {
        if let Some(log) = &self.decision_log {
            log.append(id, kind)?;
        }
        Ok(())
    }

    /// Send `action` to every participant; failures are logged, not raised
    async fn broadcast(&self, id: TxnId, participants: &[String], action: ParticipantAction) {
        for participant in participants {
            if let Err(e) = self.channel.notify(participant, action, id).await {
                log::warn!("{}: failed to send {} to '{}': {}", id, action, participant, e);
            }
        }
    }

    /// Register a distributed transaction and send PREPARE to its participants
    pub async fn initialize(&self, id: TxnId, participants: &[String]) -> Result<()> {
        {
            // Begin is appended under the records lock so compaction cannot slip in between
            let mut records = self.records.write().expect("distributed records lock poisoned");
            self.log_decision(
                id,
                DecisionKind::Begin {
                    participants: participants.to_vec(),
                },
            )?;
            records.insert(
                id,
                DistributedTransaction {
                    id,
                    coordinator: self.coordinator_id.clone(),
                    participants: participants.to_vec(),
                    votes: BTreeMap::new(),
                    phase: Phase::Preparing,
                    created_at: now_millis(),
                },
            );
        }
        log::info!("{}: distributed across {} participants", id, participants.len());
        self.broadcast(id, participants, ParticipantAction::Prepare).await;
        Ok(())
    }

    /// Run the voting phase and, on unanimity, the COMMIT broadcast.
    ///
    /// Any NO raises `DISTRIBUTED_TXN_ABORTED` and leaves the record in `voting`
    /// for the caller's abort to clean up.
    pub async fn commit(&self, id: TxnId) -> Result<()> {
        let participants = self.set_phase(id, Phase::Voting)?;

        for participant in &participants {
            let vote = self.request_vote(participant, id).await?;
            self.record_vote(id, participant, vote);
            if vote == Vote::No {
                log::info!("{}: participant '{}' voted NO", id, participant);
                return Err(CoordinatorError::DistributedTxnAborted {
                    id,
                    reason: format!("participant '{}' voted NO", participant),
                });
            }
        }

        self.set_phase(id, Phase::Committing)?;
        self.log_decision(id, DecisionKind::Commit)?;
        self.broadcast(id, &participants, ParticipantAction::Commit).await;
        self.set_phase(id, Phase::Committed)?;
        // Participants have committed; a lost End only means a repeated COMMIT on recovery
        if let Err(e) = self.log_decision(id, DecisionKind::End) {
            log::warn!("{}: failed to log end of commit: {}", id, e);
        }
        log::info!("{}: all {} participants committed", id, participants.len());
        Ok(())
    }

    /// Broadcast ABORT and drop the record
    pub async fn abort(&self, id: TxnId) -> Result<()> {
        let participants = self.set_phase(id, Phase::Aborting)?;
        self.log_decision(id, DecisionKind::Abort)?;
        self.broadcast(id, &participants, ParticipantAction::Abort).await;
        self.set_phase(id, Phase::Aborted)?;
        if let Err(e) = self.log_decision(id, DecisionKind::End) {
            log::warn!("{}: failed to log end of abort: {}", id, e);
        }
        self.remove(id);
        Ok(())
    }

    /// Drop the record of a finished (committed) transaction
    pub fn finish(&self, id: TxnId) -> Option<DistributedTransaction> {
        self.remove(id)
    }

    /// Collect one vote, applying the failure policy when the participant does
    /// not answer
    async fn request_vote(&self, participant: &str, id: TxnId) -> Result<Vote> {
        let attempts = match self.policy {
            ParticipantFailurePolicy::Retry { max_attempts, .. } => max_attempts.max(1),
            _ => 1,
        };

        let mut failure = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.vote_timeout, self.channel.collect_vote(participant, id)).await {
                Ok(Ok(vote)) => return Ok(vote),
                Ok(Err(e)) => failure = e.to_string(),
                Err(_) => failure = format!("no vote within {:?}", self.vote_timeout),
            }
            log::warn!(
                "{}: vote from '{}' failed (attempt {}/{}): {}",
                id,
                participant,
                attempt,
                attempts,
                failure
            );
            if let ParticipantFailurePolicy::Retry { backoff_ms, .. } = self.policy {
                if attempt < attempts {
                    tokio::time::sleep(retry_delay(backoff_ms, attempt)).await;
                }
            }
        }

        match self.policy {
            ParticipantFailurePolicy::Escalate => Err(CoordinatorError::Participant {
                participant: participant.to_string(),
                detail: failure,
            }),
            // Missing vote counts as NO
            _ => Ok(Vote::No),
        }
    }

    /// Finish the broadcasts of transactions left in doubt by a crash
    pub async fn recover(&self, report: &RecoveryReport) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        for entry in &report.in_doubt {
            // Tracked as in flight until End is logged, which keeps compaction away
            self.records
                .write()
                .expect("distributed records lock poisoned")
                .insert(
                    entry.txn_id,
                    DistributedTransaction {
                        id: entry.txn_id,
                        coordinator: self.coordinator_id.clone(),
                        participants: entry.participants.clone(),
                        votes: BTreeMap::new(),
                        phase: match entry.decision {
                            Some(Decision::Commit) => Phase::Committing,
                            _ => Phase::Aborting,
                        },
                        created_at: now_millis(),
                    },
                );
        }
        for entry in &report.in_doubt {
            match entry.decision {
                Some(Decision::Commit) => {
                    log::info!("{}: re-sending COMMIT after restart", entry.txn_id);
                    self.broadcast(entry.txn_id, &entry.participants, ParticipantAction::Commit)
                        .await;
                    summary.committed.push(entry.txn_id);
                }
                Some(Decision::Abort) | None => {
                    log::info!("{}: presumed abort after restart", entry.txn_id);
                    if entry.decision.is_none() {
                        self.log_decision(entry.txn_id, DecisionKind::Abort)?;
                    }
                    self.broadcast(entry.txn_id, &entry.participants, ParticipantAction::Abort)
                        .await;
                    summary.aborted.push(entry.txn_id);
                }
            }
            self.log_decision(entry.txn_id, DecisionKind::End)?;
            self.remove(entry.txn_id);
        }
        Ok(summary)
    }
}

/// Records that reproduce the recoverable state of every in-flight transaction.
/// A committed record keeps its Commit so a lost End still gets a COMMIT resend.
fn live_trails(records: &HashMap<TxnId, DistributedTransaction>) -> Vec<(TxnId, DecisionKind)> {
    let mut ids: Vec<&TxnId> = records.keys().collect();
    ids.sort();
    let mut trails = Vec::with_capacity(ids.len() * 2);
    for id in ids {
        let record = &records[id];
        trails.push((
            *id,
            DecisionKind::Begin {
                participants: record.participants.clone(),
            },
        ));
        match record.phase {
            Phase::Committing | Phase::Committed => trails.push((*id, DecisionKind::Commit)),
            Phase::Aborting | Phase::Aborted => trails.push((*id, DecisionKind::Abort)),
            Phase::Preparing | Phase::Voting => {}
        }
    }
    trails
}

/// Exponential backoff with up to 50% jitter
fn retry_delay(backoff_ms: u64, attempt: u32) -> Duration {
    let base = backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
    let jitter = if base > 1 {
        rand::thread_rng().gen_range(0..=base / 2)
    } else {
        0
    };
    Duration::from_millis(base.saturating_add(jitter))
}
