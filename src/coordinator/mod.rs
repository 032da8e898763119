//! Transaction Coordinator
//!
//! ## Lifecycle
//!
//! ```text
//! PENDING --start--> IN_PROGRESS --commit--> COMMITTING --> COMMITTED
//!                        |                      |
//!                        +--abort--> ABORTING <-+ (commit failed)
//!                                       |
//!                                       +--> ABORTED | FAILED
//! ```
//!
//! 1. START: resolve the named connection, open a session and its underlying
//!    transaction with isolation-mapped options, run 2PC initialization when
//!    distributed, register the context as active.
//! 2. WORK: `log_operation`, `create_savepoint`, `rollback_to_savepoint` and
//!    `acquire_lock` mutate the context while it is IN_PROGRESS.
//! 3. COMMIT: voting phase (distributed only), underlying commit, lock release,
//!    session end, move to history. Any failure triggers one best-effort abort
//!    before the error is returned.
//! 4. ABORT: ABORT broadcast (distributed only), underlying abort if still open,
//!    lock release, session end, move to history. Aborting a finished
//!    transaction is a no-op that reports its final state.
//!
//! ### Concurrency
//! Registries are plain `RwLock` maps never held across an `.await`. Each active
//! context sits behind its own async mutex, held for the whole of any operation
//! on it, so two callers cannot interleave mutations of the same transaction
//! while distinct transactions proceed independently.
//!
//! Readers (status, listing, metrics, the expiry sweep) never wait on that
//! mutex. A busy context is reported by the status its holder last published,
//! and the sweep leaves it for the next pass.

mod handle;
mod history;
mod sweeper;

pub use handle::TransactionHandle;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use crate::audit::{self, AuditAction, AuditDetails, AuditEvent, AuditSink, LogAuditSink, AUDIT_CATEGORY};
use crate::config::CoordinatorConfig;
use crate::context::TransactionContext;
use crate::error::{BoxError, CoordinatorError, Result};
use crate::lock::{HolderIndex, Lock, LockOptions};
use crate::protocol::{
    DecisionLog, DistributedProtocol, DistributedTransaction, ParticipantChannel, Phase,
    RecoveryReport, RecoverySummary,
};
use crate::provider::{Connection, ResourceProvider};
use crate::types::{
    AbortOptions, AbortOutcome, CommitOptions, CommitOutcome, Operation, RollbackOutcome,
    SavepointInfo, StartOptions, TransactionState, TransactionStatus, TxnId,
};

use history::History;

/// An active context and the status last published by whoever held it
struct Slot {
    id: TxnId,
    ctx: AsyncMutex<TransactionContext>,
    published: Mutex<TransactionStatus>,
    started: Instant,
}

type ContextSlot = Arc<Slot>;

impl Slot {
    fn new(ctx: TransactionContext) -> ContextSlot {
        Arc::new(Slot {
            id: ctx.id(),
            published: Mutex::new(ctx.status()),
            started: ctx.started(),
            ctx: AsyncMutex::new(ctx),
        })
    }

    fn publish(&self, ctx: &TransactionContext) {
        *self.published.lock().expect("published status lock poisoned") = ctx.status();
    }

    fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Current status without waiting: live when the context is idle, the last
    /// published one while an operation holds it
    fn peek(&self) -> TransactionStatus {
        match self.ctx.try_lock() {
            Ok(ctx) => ctx.status(),
            Err(_) => self.published.lock().expect("published status lock poisoned").clone(),
        }
    }
}

const DEFAULT_ABORT_REASON: &str = "Transaction aborted";

struct Inner {
    config: CoordinatorConfig,
    provider: Arc<dyn ResourceProvider>,
    audit: Arc<dyn AuditSink>,
    /// Present when a participant channel was supplied
    protocol: Option<DistributedProtocol>,
    /// In-doubt transactions found at startup, consumed by `recover_in_doubt`
    pending_recovery: Mutex<Option<RecoveryReport>>,
    next_txn_id: AtomicU64,
    /// Active transactions (id -> context)
    active: RwLock<HashMap<TxnId, ContextSlot>>,
    /// Finished transactions, bounded by `config.history_limit`
    history: RwLock<History>,
    /// Advisory lock holders across all active transactions
    lock_holders: Mutex<HolderIndex>,
}

/// Builder for [`TransactionCoordinator`]
pub struct CoordinatorBuilder {
    provider: Arc<dyn ResourceProvider>,
    audit: Option<Arc<dyn AuditSink>>,
    channel: Option<Arc<dyn ParticipantChannel>>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    /// Where lifecycle events go; defaults to [`LogAuditSink`]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Transport to participants; without one, distributed starts are refused
    pub fn participant_channel(mut self, channel: Arc<dyn ParticipantChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the coordinator, replaying the decision log if one is configured
    pub fn build(self) -> Result<TransactionCoordinator> {
        let (decision_log, report) = match &self.config.decision_log_path {
            Some(path) => {
                let report = DecisionLog::replay(path)?;
                let log = DecisionLog::open(path, &report)?
                    .with_compact_bytes(self.config.decision_log_compact_bytes);
                let log = Arc::new(log);
                (Some(log), report)
            }
            None => (None, RecoveryReport::default()),
        };
        Ok(self.assemble(decision_log, report))
    }

    /// Shared by `build` and `TransactionCoordinator::new`
    fn assemble(
        self,
        decision_log: Option<Arc<DecisionLog>>,
        report: RecoveryReport,
    ) -> TransactionCoordinator {
        let protocol = self.channel.map(|channel| {
            DistributedProtocol::new(
                self.config.node_id.clone(),
                channel,
                self.config.participant_failure_policy,
                self.config.vote_timeout(),
                decision_log,
            )
        });

        let pending_recovery = if report.in_doubt.is_empty() {
            None
        } else {
            log::warn!(
                "{} distributed transactions in doubt; call recover_in_doubt()",
                report.in_doubt.len()
            );
            Some(report.clone())
        };

        let history_limit = self.config.history_limit;
        TransactionCoordinator {
            inner: Arc::new(Inner {
                provider: self.provider,
                audit: self.audit.unwrap_or_else(|| Arc::new(LogAuditSink)),
                protocol,
                pending_recovery: Mutex::new(pending_recovery),
                next_txn_id: AtomicU64::new(report.max_txn_id + 1),
                active: RwLock::new(HashMap::new()),
                history: RwLock::new(History::new(history_limit)),
                lock_holders: Mutex::new(HolderIndex::default()),
                config: self.config,
            }),
        }
    }
}

/// The transaction coordinator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TransactionCoordinator {
    inner: Arc<Inner>,
}

impl TransactionCoordinator {
    pub fn builder(provider: Arc<dyn ResourceProvider>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            provider,
            audit: None,
            channel: None,
            config: CoordinatorConfig::default(),
        }
    }

    /// Coordinator with default config, log-based auditing and no participant channel
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self::builder(provider).assemble(None, RecoveryReport::default())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    fn alloc_txn_id(&self) -> TxnId {
        TxnId(self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    fn lookup(&self, id: TxnId) -> Option<ContextSlot> {
        self.inner
            .active
            .read()
            .expect("active registry lock poisoned")
            .get(&id)
            .cloned()
    }

    fn history_status(&self, id: TxnId) -> Option<TransactionStatus> {
        self.inner
            .history
            .read()
            .expect("history lock poisoned")
            .get(id)
            .cloned()
    }

    /// Error for an id that is not active: finished ones are in the wrong state,
    /// everything else is unknown
    fn not_active(&self, id: TxnId, operation: &'static str) -> CoordinatorError {
        match self.history_status(id) {
            Some(status) => CoordinatorError::InvalidState {
                id,
                actual: status.state,
                operation,
            },
            None => CoordinatorError::TransactionNotFound(id),
        }
    }

    fn slot(&self, id: TxnId, operation: &'static str) -> Result<ContextSlot> {
        self.lookup(id).ok_or_else(|| self.not_active(id, operation))
    }

    /// Move a finished context out of the active registry into history
    fn retire(&self, ctx: &TransactionContext) {
        self.inner
            .active
            .write()
            .expect("active registry lock poisoned")
            .remove(&ctx.id());
        let evicted = self
            .inner
            .history
            .write()
            .expect("history lock poisoned")
            .push(ctx.status());
        if evicted > 0 {
            log::debug!("History full, evicted {} oldest transactions", evicted);
        }
    }

    fn release_locks(&self, ctx: &mut TransactionContext) {
        let resources = ctx.locks.resources();
        let released = ctx.locks.release_all();
        if released > 0 {
            self.inner
                .lock_holders
                .lock()
                .expect("lock holder index poisoned")
                .unregister(ctx.id(), &resources);
            log::debug!("{}: released {} locks", ctx.id(), released);
        }
    }

    async fn end_session(&self, ctx: &mut TransactionContext) {
        if let Some(mut session) = ctx.session.take() {
            if let Err(e) = session.end_session().await {
                log::warn!("{}: failed to end session: {}", ctx.id(), e);
            }
        }
    }

    async fn audit(&self, action: AuditAction, ctx: &TransactionContext) {
        let event = AuditEvent {
            action,
            category: AUDIT_CATEGORY.to_string(),
            details: AuditDetails {
                transaction_id: ctx.id(),
                state: ctx.state(),
                distributed: ctx.is_distributed(),
                operation_count: ctx.operation_count(),
                duration_ms: ctx.duration().map(|d| d.as_millis() as u64),
                reason: ctx.abort_reason().map(str::to_string),
            },
            metadata: ctx.metadata.clone(),
        };
        audit::emit(&self.inner.audit, event, self.inner.config.audit_timeout()).await;
    }

    /// Start a transaction
    pub async fn start_transaction(&self, options: StartOptions) -> Result<TransactionHandle> {
        let connection_name = options
            .connection
            .unwrap_or_else(|| self.inner.config.default_connection.clone());
        let isolation = options
            .isolation_level
            .unwrap_or(self.inner.config.default_isolation);

        let connection = self
            .inner
            .provider
            .get_connection(&connection_name)
            .await
            .ok_or_else(|| CoordinatorError::NoConnection(connection_name.clone()))?;

        if options.distributed {
            if self.inner.protocol.is_none() {
                return Err(CoordinatorError::StartFailed {
                    detail: "distributed transaction requested but no participant channel is configured".into(),
                });
            }
            if options.participants.is_empty() {
                return Err(CoordinatorError::StartFailed {
                    detail: "distributed transaction requires at least one participant".into(),
                });
            }
        }

        let id = self.alloc_txn_id();
        let mut ctx = TransactionContext::new(
            id,
            connection_name,
            isolation,
            options.distributed,
            options.participants,
            options.metadata,
        );

        if let Err(e) = self.open_underlying(&mut ctx, connection.as_ref()).await {
            log::warn!("{}: start failed: {}", id, e);
            self.fail_start(&mut ctx).await;
            return Err(e.into_start_error());
        }

        ctx.transition(TransactionState::InProgress, "start")?;
        log::info!(
            "{}: started on '{}' ({:?}{})",
            id,
            ctx.connection(),
            ctx.isolation_level(),
            if ctx.is_distributed() { ", distributed" } else { "" }
        );
        self.audit(AuditAction::TransactionStarted, &ctx).await;

        self.inner
            .active
            .write()
            .expect("active registry lock poisoned")
            .insert(id, Slot::new(ctx));

        Ok(TransactionHandle::new(id, self.clone()))
    }

    /// Session + underlying transaction + 2PC registration, while still PENDING
    async fn open_underlying(
        &self,
        ctx: &mut TransactionContext,
        connection: &dyn Connection,
    ) -> Result<()> {
        let mut session = connection.start_session().await?;
        let opened = session
            .start_transaction(ctx.isolation_level().session_options())
            .await;
        ctx.session = Some(session);
        opened?;

        if ctx.is_distributed() {
            if let Some(protocol) = &self.inner.protocol {
                protocol.initialize(ctx.id(), ctx.participants()).await?;
            }
        }
        Ok(())
    }

    /// Unwind a start that never reached IN_PROGRESS
    async fn fail_start(&self, ctx: &mut TransactionContext) {
        if let Some(session) = ctx.session.as_mut() {
            if session.in_transaction() {
                if let Err(e) = session.abort_transaction().await {
                    log::warn!("{}: failed to abort half-started transaction: {}", ctx.id(), e);
                }
            }
        }
        if ctx.is_distributed() {
            if let Some(protocol) = &self.inner.protocol {
                if protocol.get(ctx.id()).is_some() {
                    if let Err(e) = protocol.abort(ctx.id()).await {
                        log::warn!("{}: failed to abort 2PC registration: {}", ctx.id(), e);
                    }
                }
            }
        }
        self.end_session(ctx).await;
        if ctx.transition(TransactionState::Failed, "start").is_ok() {
            self.retire(ctx);
            self.audit(AuditAction::TransactionFailed, ctx).await;
        }
    }

    /// Commit a transaction
    pub async fn commit_transaction(
        &self,
        id: impl Into<TxnId>,
        options: CommitOptions,
    ) -> Result<CommitOutcome> {
        let id = id.into();
        let slot = self.slot(id, "commit")?;
        let mut ctx = slot.ctx.lock().await;

        if ctx.state() != TransactionState::InProgress {
            return Err(CoordinatorError::InvalidState {
                id,
                actual: ctx.state(),
                operation: "commit",
            });
        }
        ctx.metadata.extend(options.metadata);
        ctx.transition(TransactionState::Committing, "commit")?;
        slot.publish(&ctx);

        if let Err(e) = self.commit_underlying(&mut ctx).await {
            log::warn!("{}: commit failed, aborting: {}", id, e);
            let reason = format!("Commit failed: {}", e);
            if let Err(abort_err) = self.abort_locked(&slot, &mut ctx, reason).await {
                log::error!("{}: abort after failed commit also failed: {}", id, abort_err);
            }
            return Err(e.into_commit_error(id));
        }

        ctx.transition(TransactionState::Committed, "commit")?;
        self.release_locks(&mut ctx);
        self.end_session(&mut ctx).await;
        if let Some(protocol) = &self.inner.protocol {
            protocol.finish(id);
        }
        self.retire(&ctx);
        log::info!(
            "{}: committed ({} operations, {:?})",
            id,
            ctx.operation_count(),
            ctx.duration().unwrap_or_default()
        );
        self.audit(AuditAction::TransactionCommitted, &ctx).await;

        Ok(CommitOutcome {
            id,
            state: ctx.state(),
            duration_ms: ctx.duration().map_or(0, |d| d.as_millis() as u64),
            operation_count: ctx.operation_count(),
        })
    }

    async fn commit_underlying(&self, ctx: &mut TransactionContext) -> Result<()> {
        if ctx.is_distributed() {
            let protocol = self
                .inner
                .protocol
                .as_ref()
                .ok_or(CoordinatorError::DistributedTxnNotFound(ctx.id()))?;
            protocol.commit(ctx.id()).await?;
        }
        match ctx.session.as_mut() {
            Some(session) => session.commit_transaction().await,
            None => Err(CoordinatorError::Resource("session already ended".into())),
        }
    }

    /// Abort a transaction. Finished transactions report their final state.
    pub async fn abort_transaction(
        &self,
        id: impl Into<TxnId>,
        options: AbortOptions,
    ) -> Result<AbortOutcome> {
        let id = id.into();
        let Some(slot) = self.lookup(id) else {
            return match self.history_status(id) {
                Some(status) => Ok(AbortOutcome {
                    id,
                    state: status.state,
                    reason: status.abort_reason,
                    duration_ms: status.duration_ms,
                }),
                None => Err(CoordinatorError::TransactionNotFound(id)),
            };
        };
        let mut ctx = slot.ctx.lock().await;

        if !ctx.state().is_terminal() {
            let reason = options
                .reason
                .unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string());
            self.abort_locked(&slot, &mut ctx, reason).await?;
        } else {
            log::debug!("{}: abort on finished transaction ({})", id, ctx.state());
        }

        Ok(AbortOutcome {
            id,
            state: ctx.state(),
            reason: ctx.abort_reason().map(str::to_string),
            duration_ms: ctx.duration().map(|d| d.as_millis() as u64),
        })
    }

    /// Abort with the context lock already held. Valid from IN_PROGRESS and COMMITTING.
    async fn abort_locked(
        &self,
        slot: &Slot,
        ctx: &mut TransactionContext,
        reason: String,
    ) -> Result<()> {
        let id = ctx.id();
        ctx.transition(TransactionState::Aborting, "abort")?;
        ctx.set_abort_reason(reason);
        slot.publish(ctx);

        let mut failure: Option<CoordinatorError> = None;

        if ctx.is_distributed() {
            if let Some(protocol) = &self.inner.protocol {
                match protocol.get(id).map(|r| r.phase) {
                    Some(Phase::Committed) => {
                        // Participants already told to commit; ABORT would contradict that
                        log::error!(
                            "{}: participants committed but local transaction is aborting; outcome is mixed",
                            id
                        );
                        protocol.finish(id);
                    }
                    Some(_) => {
                        if let Err(e) = protocol.abort(id).await {
                            log::warn!("{}: ABORT broadcast failed: {}", id, e);
                            failure = Some(e);
                        }
                    }
                    None => {
                        log::warn!("{}: {}", id, CoordinatorError::DistributedTxnNotFound(id));
                    }
                }
            }
        }

        if let Some(session) = ctx.session.as_mut() {
            if session.in_transaction() {
                if let Err(e) = session.abort_transaction().await {
                    log::warn!("{}: underlying abort failed: {}", id, e);
                    failure = Some(e);
                }
            }
        }

        self.release_locks(ctx);
        self.end_session(ctx).await;

        if let Some(e) = failure {
            ctx.transition(TransactionState::Failed, "abort")?;
            self.retire(ctx);
            self.audit(AuditAction::TransactionFailed, ctx).await;
            return Err(e.into_abort_error(id));
        }

        ctx.transition(TransactionState::Aborted, "abort")?;
        self.retire(ctx);
        log::info!("{}: aborted ({})", id, ctx.abort_reason().unwrap_or(DEFAULT_ABORT_REASON));
        self.audit(AuditAction::TransactionAborted, ctx).await;
        Ok(())
    }

    /// Run `callback` inside a transaction: commit on success, abort on error.
    ///
    /// Callback errors that are already coordinator errors with a domain kind are
    /// returned as they are; anything else is reported as
    /// `TRANSACTION_EXECUTION_ERROR`.
    pub async fn with_transaction<T, F, Fut>(&self, options: StartOptions, callback: F) -> Result<T>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        let handle = self.start_transaction(options).await?;
        let id = handle.id();

        match callback(handle).await {
            Ok(value) => {
                self.commit_transaction(id, CommitOptions::default()).await?;
                Ok(value)
            }
            Err(e) => {
                let err = CoordinatorError::from_callback(id, e);
                let reason = format!("Callback error: {}", err);
                if let Err(abort_err) = self.abort_transaction(id, AbortOptions::reason(reason)).await {
                    log::error!("{}: abort after callback error failed: {}", id, abort_err);
                }
                Err(err)
            }
        }
    }

    /// Append an operation record to a transaction's log
    pub async fn log_operation(&self, id: impl Into<TxnId>, operation: Operation) -> Result<()> {
        let id = id.into();
        let slot = self.slot(id, "log operation")?;
        let mut ctx = slot.ctx.lock().await;
        let seq = ctx.log_operation(operation)?;
        slot.publish(&ctx);
        log::debug!("{}: operation #{} logged", id, seq);
        Ok(())
    }

    pub async fn create_savepoint(&self, id: impl Into<TxnId>, name: &str) -> Result<SavepointInfo> {
        let id = id.into();
        let slot = self.slot(id, "create savepoint")?;
        if name.trim().is_empty() {
            return Err(CoordinatorError::MissingSavepointName);
        }
        let mut ctx = slot.ctx.lock().await;
        let info = ctx.create_savepoint(name)?;
        slot.publish(&ctx);
        Ok(info)
    }

    pub async fn rollback_to_savepoint(&self, id: impl Into<TxnId>, name: &str) -> Result<RollbackOutcome> {
        let id = id.into();
        let slot = self.slot(id, "roll back to savepoint")?;
        let mut ctx = slot.ctx.lock().await;
        let outcome = ctx.rollback_to_savepoint(name)?;
        slot.publish(&ctx);
        Ok(outcome)
    }

    /// Record an advisory lock. Overlaps with other transactions are reported in
    /// [`Lock::conflicts`] but not prevented.
    pub async fn acquire_lock(
        &self,
        id: impl Into<TxnId>,
        resource: &str,
        options: LockOptions,
    ) -> Result<Lock> {
        let id = id.into();
        let slot = self.slot(id, "acquire lock")?;
        if resource.trim().is_empty() {
            return Err(CoordinatorError::LockAcquire {
                id,
                resource: resource.to_string(),
                detail: "resource name is required".into(),
            });
        }
        let mut ctx = slot.ctx.lock().await;
        if ctx.state() != TransactionState::InProgress {
            return Err(CoordinatorError::LockAcquire {
                id,
                resource: resource.to_string(),
                detail: format!("transaction is {}", ctx.state()),
            });
        }

        let conflicts = self
            .inner
            .lock_holders
            .lock()
            .expect("lock holder index poisoned")
            .register(id, resource, options.lock_type);
        if !conflicts.is_empty() {
            log::warn!(
                "{}: advisory lock on '{}' overlaps with {:?} (not enforced)",
                id,
                resource,
                conflicts
            );
        }

        ctx.locks.acquire(id, resource, options.lock_type);
        ctx.locks.set_conflicts(resource, conflicts);
        slot.publish(&ctx);
        log::debug!("{}: locked '{}' ({:?})", id, resource, options.lock_type);
        ctx.locks
            .get(resource)
            .cloned()
            .ok_or_else(|| CoordinatorError::LockAcquire {
                id,
                resource: resource.to_string(),
                detail: "lock vanished after acquisition".into(),
            })
    }

    /// Status of an active or finished transaction. Does not wait for an
    /// operation in progress on it.
    pub async fn get_transaction_status(&self, id: impl Into<TxnId>) -> Option<TransactionStatus> {
        let id = id.into();
        match self.lookup(id) {
            Some(slot) => Some(slot.peek()),
            None => self.history_status(id),
        }
    }

    /// Protocol record of a distributed transaction still being coordinated
    pub fn get_distributed_transaction(&self, id: impl Into<TxnId>) -> Option<DistributedTransaction> {
        let id = id.into();
        self.inner.protocol.as_ref().and_then(|p| p.get(id))
    }

    /// Finish broadcasts left in doubt by a previous run (needs a decision log).
    /// Compacts the log afterwards when nothing distributed is in flight.
    pub async fn recover_in_doubt(&self) -> Result<RecoverySummary> {
        let report = self
            .inner
            .pending_recovery
            .lock()
            .expect("pending recovery lock poisoned")
            .take();
        let summary = match (report, &self.inner.protocol) {
            (Some(report), Some(protocol)) => protocol.recover(&report).await?,
            (Some(report), None) => {
                // Without a channel the broadcast cannot be repeated; keep it for later
                *self
                    .inner
                    .pending_recovery
                    .lock()
                    .expect("pending recovery lock poisoned") = Some(report);
                return Err(CoordinatorError::Config(
                    "recovery needs a participant channel".into(),
                ));
            }
            (None, _) => RecoverySummary::default(),
        };

        if let Some(protocol) = &self.inner.protocol {
            protocol.compact();
        }
        Ok(summary)
    }
}
