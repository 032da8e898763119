//! Expiry sweep and registry-wide queries.
//!
//! Nothing here runs on its own: the owner of the coordinator decides when to
//! sweep (a `tokio::time::interval`, a cron tick, a test). None of it waits on a
//! context that an operation is holding.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::{CleanupReport, Metrics, TransactionFilter, TransactionState, TransactionStatus};

use super::{ContextSlot, TransactionCoordinator};

const EXPIRED_REASON: &str = "Transaction expired";

impl TransactionCoordinator {
    fn active_slots(&self) -> Vec<ContextSlot> {
        self.inner
            .active
            .read()
            .expect("active registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Force-abort every active transaction at least `max_age` old, then trim
    /// history to its cap. Individual abort failures are logged and the sweep
    /// continues. Transactions busy with another operation are skipped.
    pub async fn cleanup_expired_transactions(&self, max_age: Duration) -> CleanupReport {
        let mut expired_count = 0;
        let mut cleaned_count = 0;
        let mut skipped_count = 0;

        for slot in self.active_slots() {
            if slot.age() < max_age {
                continue;
            }
            let Ok(mut ctx) = slot.ctx.try_lock() else {
                log::info!(
                    "{}: expired after {:?} but busy, left for the next sweep",
                    slot.id,
                    slot.age()
                );
                expired_count += 1;
                skipped_count += 1;
                continue;
            };
            // Finished between the registry snapshot and the lock
            if ctx.state().is_terminal() {
                continue;
            }
            expired_count += 1;
            let id = ctx.id();
            log::info!("{}: expired after {:?}, aborting", id, ctx.age());
            match self.abort_locked(&slot, &mut ctx, EXPIRED_REASON.to_string()).await {
                Ok(()) => cleaned_count += 1,
                Err(e) => log::error!("{}: failed to abort expired transaction: {}", id, e),
            }
        }

        let evicted = self.inner.history.write().expect("history lock poisoned").trim();
        if evicted > 0 {
            log::debug!("Cleanup evicted {} history entries", evicted);
        }

        let report = CleanupReport {
            expired_count,
            cleaned_count,
            skipped_count,
            active_transactions: self.inner.active.read().expect("active registry lock poisoned").len(),
            history_size: self.inner.history.read().expect("history lock poisoned").len(),
        };
        if report.expired_count > 0 || report.skipped_count > 0 {
            log::info!(
                "Cleanup: {} expired, {} aborted, {} busy, {} still active",
                report.expired_count,
                report.cleaned_count,
                report.skipped_count,
                report.active_transactions
            );
        }
        report
    }

    /// Sweep with `CoordinatorConfig::default_max_age_ms`
    pub async fn cleanup_expired_default(&self) -> CleanupReport {
        self.cleanup_expired_transactions(self.inner.config.default_max_age())
            .await
    }

    /// Snapshots of active transactions matching `filter`, oldest first
    pub async fn list_active_transactions(&self, filter: &TransactionFilter) -> Vec<TransactionStatus> {
        let mut matched = Vec::new();
        for slot in self.active_slots() {
            let status = slot.peek();
            if filter.matches(&status, slot.age()) {
                matched.push(status);
            }
        }
        matched.sort_by_key(|s| (s.start_time, s.id));
        matched
    }

    /// Counts across the active and history registries
    pub async fn get_metrics(&self) -> Metrics {
        let mut active_states = Vec::new();
        for slot in self.active_slots() {
            let status = slot.peek();
            active_states.push((status.state, status.distributed));
        }

        let mut by_state: BTreeMap<TransactionState, usize> = BTreeMap::new();
        let mut distributed = 0;
        for (state, is_distributed) in &active_states {
            *by_state.entry(*state).or_insert(0) += 1;
            if *is_distributed {
                distributed += 1;
            }
        }

        let history = self.inner.history.read().expect("history lock poisoned");
        let mut durations = Vec::new();
        for status in history.iter() {
            *by_state.entry(status.state).or_insert(0) += 1;
            if status.distributed {
                distributed += 1;
            }
            if let Some(ms) = status.duration_ms {
                durations.push(ms);
            }
        }

        let average_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        Metrics {
            active_transactions: active_states.len(),
            historical_transactions: history.len(),
            total_transactions: active_states.len() + history.len(),
            distributed_transactions: distributed,
            transactions_by_state: by_state,
            average_duration_ms,
        }
    }
}
