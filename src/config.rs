//! Configuration for the transaction coordinator

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::decision_log::DEFAULT_COMPACT_BYTES;
use crate::types::IsolationLevel;

/// What the coordinator does when a participant cannot deliver a vote
/// (the channel errors or the vote times out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ParticipantFailurePolicy {
    /// Treat the missing vote as NO and abort the distributed transaction
    Abort,
    /// Ask again with exponential backoff; give up as NO after `max_attempts`
    Retry { max_attempts: u32, backoff_ms: u64 },
    /// Surface the participant failure to the caller as a commit error
    Escalate,
}

impl Default for ParticipantFailurePolicy {
    fn default() -> Self {
        ParticipantFailurePolicy::Abort
    }
}

/// Coordinator configuration
///
/// # Presets
///
/// - [`CoordinatorConfig::default()`] - in-memory only, abort on participant failure
/// - [`CoordinatorConfig::durable()`] - records 2PC decisions in a decision log
/// - [`CoordinatorConfig::strict()`] - short timeouts, participant failures escalate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name this coordinator reports in distributed transaction records
    pub node_id: String,
    /// Connection used when `StartOptions::connection` is unset
    pub default_connection: String,
    /// Isolation used when `StartOptions::isolation_level` is unset
    pub default_isolation: IsolationLevel,
    /// Maximum number of finished transactions kept in history
    pub history_limit: usize,
    /// How long to wait for one participant's vote (milliseconds)
    pub vote_timeout_ms: u64,
    /// How long an audit write may take before it is abandoned (milliseconds)
    pub audit_timeout_ms: u64,
    pub participant_failure_policy: ParticipantFailurePolicy,
    /// Age after which `cleanup_expired_default` aborts a transaction (milliseconds)
    pub default_max_age_ms: u64,
    /// When set, 2PC decisions are logged here for crash recovery
    pub decision_log_path: Option<PathBuf>,
    /// Size past which the decision log is rewritten down to its in-flight trails
    pub decision_log_compact_bytes: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "coordinator".to_string(),
            default_connection: "default".to_string(),
            default_isolation: IsolationLevel::ReadCommitted,
            history_limit: 1000,
            vote_timeout_ms: 5000,
            audit_timeout_ms: 1000,
            participant_failure_policy: ParticipantFailurePolicy::Abort,
            default_max_age_ms: 5 * 60 * 1000, // 5 minutes
            decision_log_path: None,
            decision_log_compact_bytes: DEFAULT_COMPACT_BYTES,
        }
    }
}

impl CoordinatorConfig {
    /// Record distributed commit/abort decisions in `path`
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            decision_log_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Fail fast: short timeouts and participant failures reach the caller
    pub fn strict() -> Self {
        Self {
            vote_timeout_ms: 500,
            audit_timeout_ms: 200,
            participant_failure_policy: ParticipantFailurePolicy::Escalate,
            default_max_age_ms: 30 * 1000,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit_timeout_ms)
    }

    pub fn default_max_age(&self) -> Duration {
        Duration::from_millis(self.default_max_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoordinatorConfig::from_json_str(
            r#"{
                "history_limit": 10,
                "default_isolation": "SNAPSHOT",
                "participant_failure_policy": { "policy": "retry", "max_attempts": 3, "backoff_ms": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.default_isolation, IsolationLevel::Snapshot);
        assert_eq!(
            config.participant_failure_policy,
            ParticipantFailurePolicy::Retry {
                max_attempts: 3,
                backoff_ms: 5
            }
        );
        assert_eq!(config.default_connection, "default");
        assert_eq!(config.node_id, "coordinator");
        assert!(config.decision_log_path.is_none());
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = CoordinatorConfig::from_json_str("{ nope").unwrap_err();
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            CoordinatorConfig::strict().participant_failure_policy,
            ParticipantFailurePolicy::Escalate
        );
        let durable = CoordinatorConfig::durable("/tmp/decisions.log");
        assert_eq!(durable.decision_log_path, Some(PathBuf::from("/tmp/decisions.log")));
        assert_eq!(durable.history_limit, 1000);
    }
}
