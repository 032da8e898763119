//! Durable log of two-phase-commit decisions
//!
//! A coordinator that crashes between deciding COMMIT and telling every
//! participant must be able to finish the job on restart. Each distributed
//! transaction leaves this trail:
//!
//! ```text
//! Begin{participants} -> Commit | Abort -> End
//! ```
//!
//! Commit and Abort are fsynced before the first notification goes out. On
//! replay, a transaction with a Begin but no End is *in doubt*: if its decision
//! was Commit the COMMIT broadcast is repeated, otherwise it is presumed aborted.
//!
//! ### Format
//! Same framing as a WAL: a 4-byte little-endian length prefix followed by a
//! bincode-encoded [`DecisionRecord`].
//!
//! ### Compaction
//! The log is truncated when nothing is in flight. Past `compact_bytes` it is
//! rewritten to hold only the trails of transactions still in flight.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};
use crate::types::{now_millis, TxnId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    /// Distributed transaction registered with these participants
    Begin { participants: Vec<String> },
    /// Every participant voted YES; COMMIT is being broadcast
    Commit,
    /// ABORT is being broadcast
    Abort,
    /// Broadcast finished; nothing left to recover
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub seq: u64,
    pub txn_id: TxnId,
    pub kind: DecisionKind,
    /// Unix epoch millis
    pub timestamp: u64,
}

/// Final decision of an in-doubt transaction, if one was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

/// A distributed transaction whose broadcast never finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InDoubt {
    pub txn_id: TxnId,
    pub participants: Vec<String>,
    pub decision: Option<Decision>,
}

/// What a replay of the log found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records_read: usize,
    pub max_seq: u64,
    pub max_txn_id: u64,
    pub in_doubt: Vec<InDoubt>,
}

/// Default size past which the log is rewritten down to its live trails
pub const DEFAULT_COMPACT_BYTES: u64 = 1024 * 1024;

/// Append-only decision log
pub struct DecisionLog {
    path: PathBuf,
    file: Mutex<File>,
    next_seq: AtomicU64,
    compact_bytes: u64,
    #[cfg(test)]
    fail_end: std::sync::atomic::AtomicBool,
}

impl DecisionLog {
    /// Open (or create) the log, continuing the sequence after `report.max_seq`
    pub fn open(path: &Path, report: &RecoveryReport) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            next_seq: AtomicU64::new(report.max_seq + 1),
            compact_bytes: DEFAULT_COMPACT_BYTES,
            #[cfg(test)]
            fail_end: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Rewrite threshold in bytes
    pub fn with_compact_bytes(mut self, bytes: u64) -> Self {
        self.compact_bytes = bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame(seq: u64, txn_id: TxnId, kind: DecisionKind) -> Result<Vec<u8>> {
        let record = DecisionRecord {
            seq,
            txn_id,
            kind,
            timestamp: now_millis(),
        };
        let encoded = bincode::serialize(&record)?;
        let len = u32::try_from(encoded.len())
            .map_err(|_| CoordinatorError::Codec(format!("decision record {} too large", seq)))?;
        let mut frame = Vec::with_capacity(4 + encoded.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&encoded);
        Ok(frame)
    }

    fn lock_file(&self) -> Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| CoordinatorError::Codec("decision log mutex poisoned".into()))
    }

    /// Append a record. Decisions (Commit/Abort) are fsynced before returning.
    pub fn append(&self, txn_id: TxnId, kind: DecisionKind) -> Result<u64> {
        #[cfg(test)]
        if kind == DecisionKind::End && self.fail_end.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(IoErrorKind::Other, "end record write failed").into());
        }
        let durable = matches!(kind, DecisionKind::Commit | DecisionKind::Abort);
        let mut file = self.lock_file()?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        file.write_all(&Self::frame(seq, txn_id, kind)?)?;
        if durable {
            file.sync_data()?;
        }
        Ok(seq)
    }

    /// Make every following `End` append fail
    #[cfg(test)]
    pub(crate) fn fail_end_records(&self, fail: bool) {
        self.fail_end.store(fail, Ordering::SeqCst);
    }

    /// Length of the log file in bytes
    pub fn size_bytes(&self) -> Result<u64> {
        Ok(self.lock_file()?.metadata()?.len())
    }

    /// Whether the log has grown past its rewrite threshold
    pub fn needs_rewrite(&self) -> Result<bool> {
        Ok(self.size_bytes()? > self.compact_bytes)
    }

    /// Drop every record. Only safe when nothing is in doubt.
    pub fn truncate(&self) -> Result<()> {
        let file = self.lock_file()?;
        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Replace the log with `trails`, the records in-flight transactions still
    /// need. The new log is written beside the old one and renamed over it.
    pub fn rewrite(&self, trails: Vec<(TxnId, DecisionKind)>) -> Result<()> {
        let mut file = self.lock_file()?;
        let staging = self.path.with_extension("rewrite");
        {
            let mut out = File::create(&staging)?;
            for (txn_id, kind) in trails {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                out.write_all(&Self::frame(seq, txn_id, kind)?)?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&staging, &self.path)?;
        *file = OpenOptions::new().append(true).open(&self.path)?;
        log::debug!("Decision log rewritten to {} bytes", file.metadata()?.len());
        Ok(())
    }

    /// Read the whole log and work out which transactions are in doubt
    pub fn replay(path: &Path) -> Result<RecoveryReport> {
        if !path.exists() {
            return Ok(RecoveryReport::default());
        }
        let mut file = File::open(path)?;
        let mut report = RecoveryReport::default();
        let mut open: BTreeMap<TxnId, InDoubt> = BTreeMap::new();

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(ref e) if e.kind() == IoErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut record_buf = vec![0u8; len];
            match file.read_exact(&mut record_buf) {
                Ok(()) => {}
                Err(ref e) if e.kind() == IoErrorKind::UnexpectedEof => {
                    log::warn!("Decision log ends with a torn record; ignoring it");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let record: DecisionRecord = match bincode::deserialize(&record_buf) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Skipping malformed decision record: {}", e);
                    continue;
                }
            };

            report.records_read += 1;
            report.max_seq = report.max_seq.max(record.seq);
            report.max_txn_id = report.max_txn_id.max(record.txn_id.0);

            match record.kind {
                DecisionKind::Begin { participants } => {
                    open.insert(
                        record.txn_id,
                        InDoubt {
                            txn_id: record.txn_id,
                            participants,
                            decision: None,
                        },
                    );
                }
                DecisionKind::Commit => {
                    if let Some(entry) = open.get_mut(&record.txn_id) {
                        entry.decision = Some(Decision::Commit);
                    }
                }
                DecisionKind::Abort => {
                    if let Some(entry) = open.get_mut(&record.txn_id) {
                        entry.decision = Some(Decision::Abort);
                    }
                }
                DecisionKind::End => {
                    open.remove(&record.txn_id);
                }
            }
        }

        report.in_doubt = open.into_values().collect();
        if !report.in_doubt.is_empty() {
            log::info!(
                "Decision log replay: {} records, {} in-doubt transactions",
                report.records_read,
                report.in_doubt.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn participants() -> Vec<String> {
        vec!["inventory".to_string(), "billing".to_string()]
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let report = DecisionLog::replay(&dir.path().join("nope.log")).unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[test]
    fn test_replay_classifies_in_doubt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.log");
        let log = DecisionLog::open(&path, &RecoveryReport::default()).unwrap();

        // Finished cleanly
        log.append(TxnId(1), DecisionKind::Begin { participants: participants() }).unwrap();
        log.append(TxnId(1), DecisionKind::Commit).unwrap();
        log.append(TxnId(1), DecisionKind::End).unwrap();
        // Crashed mid-commit broadcast
        log.append(TxnId(2), DecisionKind::Begin { participants: participants() }).unwrap();
        log.append(TxnId(2), DecisionKind::Commit).unwrap();
        // Crashed before deciding
        log.append(TxnId(3), DecisionKind::Begin { participants: participants() }).unwrap();
        drop(log);

        let report = DecisionLog::replay(&path).unwrap();
        assert_eq!(report.records_read, 6);
        assert_eq!(report.max_txn_id, 3);
        assert_eq!(report.in_doubt.len(), 2);
        assert_eq!(report.in_doubt[0].txn_id, TxnId(2));
        assert_eq!(report.in_doubt[0].decision, Some(Decision::Commit));
        assert_eq!(report.in_doubt[1].txn_id, TxnId(3));
        assert_eq!(report.in_doubt[1].decision, None);
        assert_eq!(report.in_doubt[1].participants, participants());
    }

    #[test]
    fn test_sequence_continues_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.log");
        let log = DecisionLog::open(&path, &RecoveryReport::default()).unwrap();
        log.append(TxnId(1), DecisionKind::Begin { participants: vec![] }).unwrap();
        let last = log.append(TxnId(1), DecisionKind::Abort).unwrap();
        drop(log);

        let report = DecisionLog::replay(&path).unwrap();
        assert_eq!(report.max_seq, last);
        let log = DecisionLog::open(&path, &report).unwrap();
        assert_eq!(log.append(TxnId(1), DecisionKind::End).unwrap(), last + 1);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.log");
        let log = DecisionLog::open(&path, &RecoveryReport::default()).unwrap();
        log.append(TxnId(5), DecisionKind::Begin { participants: participants() }).unwrap();
        drop(log);

        // Length prefix promising more bytes than exist
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let report = DecisionLog::replay(&path).unwrap();
        assert_eq!(report.records_read, 1);
        assert_eq!(report.in_doubt.len(), 1);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.log");
        let log = DecisionLog::open(&path, &RecoveryReport::default()).unwrap();
        for n in 1..=10 {
            log.append(TxnId(n), DecisionKind::Begin { participants: participants() }).unwrap();
            log.append(TxnId(n), DecisionKind::Abort).unwrap();
            log.append(TxnId(n), DecisionKind::End).unwrap();
        }
        let before = log.size_bytes().unwrap();

        log.rewrite(vec![
            (TxnId(11), DecisionKind::Begin { participants: participants() }),
            (TxnId(11), DecisionKind::Commit),
        ])
        .unwrap();
        assert!(log.size_bytes().unwrap() < before);
        assert!(!path.with_extension("rewrite").exists());

        let last = log.append(TxnId(12), DecisionKind::Begin { participants: vec![] }).unwrap();
        let report = DecisionLog::replay(&path).unwrap();
        assert_eq!(report.records_read, 3);
        assert_eq!(report.max_seq, last);
        assert_eq!(report.in_doubt.len(), 2);
        assert_eq!(report.in_doubt[0].txn_id, TxnId(11));
        assert_eq!(report.in_doubt[0].decision, Some(Decision::Commit));
    }

    #[test]
    fn test_truncate_empties_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.log");
        let log = DecisionLog::open(&path, &RecoveryReport::default()).unwrap();
        log.append(TxnId(1), DecisionKind::Begin { participants: participants() }).unwrap();
        log.truncate().unwrap();
        assert_eq!(DecisionLog::replay(&path).unwrap().records_read, 0);
    }
}
