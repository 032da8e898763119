use std::collections::HashSet;
use std::sync::Arc;

use minitxn::memory::{Fault, MemoryAuditSink, MemoryProvider};
use minitxn::{
    AbortOptions, AuditAction, BoxError, CommitOptions, CoordinatorConfig, CoordinatorError, IsolationLevel,
    Operation, StartOptions, TransactionCoordinator, TransactionState, TxnId,
};
use serde_json::json;

fn setup() -> (TransactionCoordinator, Arc<MemoryProvider>, Arc<MemoryAuditSink>) {
    let provider = Arc::new(MemoryProvider::with_connection("default"));
    let audit = Arc::new(MemoryAuditSink::new());
    let coordinator = TransactionCoordinator::builder(provider.clone())
        .audit_sink(audit.clone())
        .build()
        .unwrap();
    (coordinator, provider, audit)
}

#[tokio::test]
async fn test_snapshot_commit_scenario() {
    let (coordinator, provider, audit) = setup();

    let txn = coordinator
        .start_transaction(StartOptions::new().isolation(IsolationLevel::Snapshot))
        .await
        .unwrap();
    txn.log_operation(Operation::with_details("insert", json!({ "table": "users" })))
        .await
        .unwrap();
    txn.log_operation(Operation::new("update")).await.unwrap();

    let outcome = coordinator
        .commit_transaction(&txn, CommitOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.state, TransactionState::Committed);
    assert_eq!(outcome.operation_count, 2);

    let options = provider.connection("default").unwrap().last_options().unwrap();
    assert_eq!(options.isolation_level, IsolationLevel::Snapshot);

    let status = coordinator.get_transaction_status(&txn).await.unwrap();
    assert_eq!(
        status.state_history,
        vec![
            TransactionState::Pending,
            TransactionState::InProgress,
            TransactionState::Committing,
            TransactionState::Committed,
        ]
    );
    assert!(status.end_time.is_some());
    assert_eq!(
        audit.actions_for(txn.id()),
        vec![AuditAction::TransactionStarted, AuditAction::TransactionCommitted]
    );
}

#[tokio::test]
async fn test_unknown_connection() {
    let (coordinator, _, _) = setup();
    let err = coordinator
        .start_transaction(StartOptions::new().connection("reporting"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_CONNECTION");
    assert!(err.to_string().contains("reporting"));
}

#[tokio::test]
async fn test_session_failure_is_start_error() {
    let (coordinator, provider, _) = setup();
    provider
        .connection("default")
        .unwrap()
        .set_fault(Fault::StartSession, true);

    let err = coordinator.start_transaction(StartOptions::new()).await.unwrap_err();
    assert_eq!(err.code(), "TRANSACTION_START_ERROR");
    assert_eq!(coordinator.get_metrics().await.active_transactions, 0);
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let (coordinator, provider, audit) = setup();
    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();

    let first = coordinator
        .abort_transaction(&txn, AbortOptions::reason("user cancelled"))
        .await
        .unwrap();
    assert_eq!(first.state, TransactionState::Aborted);
    assert_eq!(first.reason.as_deref(), Some("user cancelled"));

    let second = coordinator
        .abort_transaction(&txn, AbortOptions::default())
        .await
        .unwrap();
    assert_eq!(second.state, TransactionState::Aborted);
    assert_eq!(second.reason.as_deref(), Some("user cancelled"));

    let stats = provider.connection("default").unwrap().stats();
    assert_eq!(stats.aborts, 1);
    assert_eq!(stats.sessions_ended, 1);
    assert_eq!(
        audit.actions_for(txn.id()),
        vec![AuditAction::TransactionStarted, AuditAction::TransactionAborted]
    );
}

#[tokio::test]
async fn test_default_abort_reason() {
    let (coordinator, _, _) = setup();
    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    let outcome = coordinator
        .abort_transaction(&txn, AbortOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.reason.as_deref(), Some("Transaction aborted"));
}

#[tokio::test]
async fn test_abort_after_commit_reports_committed() {
    let (coordinator, _, _) = setup();
    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    txn.commit().await.unwrap();

    let outcome = txn.abort("too late").await.unwrap();
    assert_eq!(outcome.state, TransactionState::Committed);
    assert!(outcome.reason.is_none());
}

#[tokio::test]
async fn test_double_commit() {
    let (coordinator, _, _) = setup();
    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    txn.commit().await.unwrap();

    let err = txn.commit().await.unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSACTION_STATE");

    let err = coordinator
        .commit_transaction(TxnId(999), CommitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSACTION_NOT_FOUND");
}

#[tokio::test]
async fn test_commit_failure_aborts() {
    let (coordinator, provider, audit) = setup();
    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    txn.log_operation(Operation::new("insert")).await.unwrap();
    provider.connection("default").unwrap().set_fault(Fault::Commit, true);

    let err = txn.commit().await.unwrap_err();
    assert_eq!(err.code(), "TRANSACTION_COMMIT_ERROR");

    let status = txn.status().await.unwrap();
    assert_eq!(status.state, TransactionState::Aborted);
    assert!(status.abort_reason.unwrap().starts_with("Commit failed"));
    assert_eq!(
        audit.actions_for(txn.id()),
        vec![AuditAction::TransactionStarted, AuditAction::TransactionAborted]
    );
}

#[tokio::test]
async fn test_abort_failure_marks_failed() {
    let (coordinator, provider, audit) = setup();
    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    provider.connection("default").unwrap().set_fault(Fault::Abort, true);

    let err = txn.abort("cancel").await.unwrap_err();
    assert_eq!(err.code(), "TRANSACTION_ABORT_ERROR");

    let status = txn.status().await.unwrap();
    assert_eq!(status.state, TransactionState::Failed);
    assert_eq!(
        provider.connection("default").unwrap().stats().sessions_ended,
        1
    );
    assert_eq!(
        audit.actions_for(txn.id()),
        vec![AuditAction::TransactionStarted, AuditAction::TransactionFailed]
    );
}

#[tokio::test]
async fn test_audit_failures_do_not_block() {
    let (coordinator, _, audit) = setup();
    audit.set_failing(true);

    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    let outcome = txn.commit().await.unwrap();
    assert_eq!(outcome.state, TransactionState::Committed);
    assert!(audit.events().is_empty());
}

#[tokio::test]
async fn test_commit_metadata_reaches_audit() {
    let (coordinator, _, audit) = setup();
    let txn = coordinator
        .start_transaction(StartOptions::new().metadata("user", "alice"))
        .await
        .unwrap();
    let mut options = CommitOptions::default();
    options.metadata.insert("ticket".into(), json!(42));
    coordinator.commit_transaction(&txn, options).await.unwrap();

    let committed = audit
        .events()
        .into_iter()
        .find(|e| e.action == AuditAction::TransactionCommitted)
        .unwrap();
    assert_eq!(committed.metadata["user"], json!("alice"));
    assert_eq!(committed.metadata["ticket"], json!(42));
    assert_eq!(committed.category, "transaction");
}

#[tokio::test]
async fn test_concurrent_starts_get_unique_ids() {
    let (coordinator, _, _) = setup();

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .start_transaction(StartOptions::new())
                .await
                .map(|h| h.id())
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 64);
    assert_eq!(coordinator.get_metrics().await.active_transactions, 64);
}

#[tokio::test]
async fn test_states_stay_in_lifecycle() {
    let (coordinator, provider, _) = setup();
    let conn = provider.connection("default").unwrap();

    let ok = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    ok.commit().await.unwrap();
    let aborted = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    aborted.abort("no").await.unwrap();
    conn.set_fault(Fault::Commit, true);
    let bad = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    let _ = bad.commit().await;

    for handle in [&ok, &aborted, &bad] {
        let status = handle.status().await.unwrap();
        for pair in status.state_history.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} is not a lifecycle edge",
                pair[0],
                pair[1]
            );
        }
        assert!(status.state.is_terminal());
    }
}

#[tokio::test]
async fn test_with_transaction_commits() {
    let (coordinator, _, _) = setup();
    let value = coordinator
        .with_transaction(StartOptions::new(), |txn| async move {
            txn.log_operation(Operation::new("insert")).await?;
            Ok::<_, BoxError>(txn.id())
        })
        .await
        .unwrap();

    let status = coordinator.get_transaction_status(value).await.unwrap();
    assert_eq!(status.state, TransactionState::Committed);
    assert_eq!(status.operation_count, 1);
}

#[tokio::test]
async fn test_with_transaction_callback_error() {
    let (coordinator, _, _) = setup();
    let err = coordinator
        .with_transaction(StartOptions::new(), |_txn| async move {
            Err::<(), BoxError>("disk full".into())
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSACTION_EXECUTION_ERROR");

    let status = coordinator.get_transaction_status(TxnId(1)).await.unwrap();
    assert_eq!(status.state, TransactionState::Aborted);
    assert!(status.abort_reason.unwrap().contains("disk full"));
}

#[tokio::test]
async fn test_with_transaction_keeps_domain_errors() {
    let (coordinator, _, _) = setup();
    let err = coordinator
        .with_transaction(StartOptions::new(), |txn| async move {
            txn.rollback_to_savepoint("missing").await?;
            Ok::<(), BoxError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::SavepointNotFound { .. }));
    assert_eq!(err.code(), "SAVEPOINT_NOT_FOUND");
}

#[tokio::test]
async fn test_default_isolation_from_config() {
    let provider = Arc::new(MemoryProvider::with_connection("primary"));
    let coordinator = TransactionCoordinator::builder(provider.clone())
        .config(CoordinatorConfig {
            default_connection: "primary".into(),
            default_isolation: IsolationLevel::Serializable,
            ..Default::default()
        })
        .build()
        .unwrap();

    let txn = coordinator.start_transaction(StartOptions::new()).await.unwrap();
    let status = txn.status().await.unwrap();
    assert_eq!(status.connection, "primary");
    assert_eq!(status.isolation_level, IsolationLevel::Serializable);
}
