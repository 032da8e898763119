//! MiniTxn demo runner
//!
//! Drives a workload through the coordinator using the in-memory provider and a
//! simulated participant channel, then prints metrics and a cleanup report as
//! JSON on stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::json;

use minitxn::memory::{MemoryAuditSink, MemoryProvider, SimulatedChannel};
use minitxn::{
    CoordinatorConfig, LockOptions, Operation, StartOptions, TransactionCoordinator, Vote,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut transactions: usize = 10;
    let mut participants: Vec<String> = Vec::new();
    let mut reject: Option<String> = None;
    let mut max_age_ms: Option<u64> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--transactions" | "-n" => {
                if i + 1 < args.len() {
                    transactions = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--participants" | "-p" => {
                if i + 1 < args.len() {
                    participants = args[i + 1]
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect();
                    i += 1;
                }
            }
            "--reject" | "-r" => {
                if i + 1 < args.len() {
                    reject = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--max-age-ms" | "-m" => {
                if i + 1 < args.len() {
                    max_age_ms = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("MiniTxn - transaction coordinator demo");
                println!();
                println!("Usage: minitxn [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config FILE          JSON coordinator config");
                println!("  -n, --transactions N       Transactions to run (default: 10)");
                println!("  -p, --participants A,B,C   Make every other transaction distributed");
                println!("  -r, --reject NAME          Participant that votes NO");
                println!("  -m, --max-age-ms MS        Max age for the final cleanup sweep");
                println!("  -h, --help                 Show this help");
                return Ok(());
            }
            other => {
                warn!("Ignoring unknown argument '{}'", other);
            }
        }
        i += 1;
    }

    let config = match &config_path {
        Some(path) => CoordinatorConfig::from_json_file(path)?,
        None => CoordinatorConfig::default(),
    };
    let max_age = max_age_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.default_max_age());

    let provider = Arc::new(MemoryProvider::with_connection(&config.default_connection));
    let channel = Arc::new(SimulatedChannel::new());
    if let Some(name) = &reject {
        channel.set_vote(name, Vote::No);
    }
    let audit = Arc::new(MemoryAuditSink::new());

    let coordinator = TransactionCoordinator::builder(provider)
        .config(config)
        .participant_channel(channel)
        .audit_sink(audit.clone())
        .build()?;

    let recovered = coordinator.recover_in_doubt().await?;
    if !recovered.committed.is_empty() || !recovered.aborted.is_empty() {
        info!(
            "Recovered {} committed and {} aborted transactions from the decision log",
            recovered.committed.len(),
            recovered.aborted.len()
        );
    }

    info!("Running {} transactions...", transactions);

    let mut tasks = Vec::with_capacity(transactions);
    for n in 0..transactions {
        let coordinator = coordinator.clone();
        let participants = participants.clone();
        tasks.push(tokio::spawn(async move {
            let mut options = StartOptions::new().metadata("worker", n as u64);
            if !participants.is_empty() && n % 2 == 1 {
                options = options.distributed(participants);
            }
            let txn = coordinator.start_transaction(options).await?;
            txn.acquire_lock(&format!("account:{}", n % 3), LockOptions::default())
                .await?;
            txn.log_operation(Operation::with_details("debit", json!({ "amount": 10 })))
                .await?;
            txn.create_savepoint("after_debit").await?;
            txn.log_operation(Operation::with_details("credit", json!({ "amount": 10 })))
                .await?;
            if n % 4 == 3 {
                txn.rollback_to_savepoint("after_debit").await?;
            }
            // Every fifth transaction is left open for the sweeper
            if n % 5 == 4 {
                return Ok(None);
            }
            txn.commit().await.map(Some)
        }));
    }

    let mut committed = 0;
    let mut failed = 0;
    for task in tasks {
        match task.await? {
            Ok(Some(_)) => committed += 1,
            Ok(None) => {}
            Err(e) => {
                warn!("Transaction failed: {} ({})", e, e.code());
                failed += 1;
            }
        }
    }
    info!("{} committed, {} failed", committed, failed);

    let cleanup = coordinator.cleanup_expired_transactions(max_age).await;
    let metrics = coordinator.get_metrics().await;

    let report = json!({
        "metrics": metrics,
        "cleanup": cleanup,
        "audit_events": audit.events().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
