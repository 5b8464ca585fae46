//! txn_recovery - Payment Transaction Recovery Daemon
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│  Audit   │───▶│  State   │───▶│ Workers  │
//! │  (YAML)  │    │(Journal) │    │(Rehydrate│    │(Sweep +  │
//! └──────────┘    └──────────┘    │  +Store) │    │ Notify)  │
//!                                 └──────────┘    └──────────┘
//! ```
//!
//! On start the daemon rebuilds live state from the audit journal and
//! finishes any rollback a previous run left in `ROLLBACK_INITIATED`. The
//! remaining recovery operations are library calls on `RecoveryOrchestrator`;
//! the binary exposes no request surface for them.
//!
//! `--verify-audit` checks the journal and exits.

use anyhow::Context;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use txn_recovery::config::AppConfig;
use txn_recovery::recovery::{
    AuditLog, LoggingSink, NotificationDispatcher, RecoveryOrchestrator, RetentionConfig,
    RetentionWorker, RpcLedgerGateway, TransactionStateStore, notification_channel,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn verify_only() -> bool {
    std::env::args().any(|a| a == "--verify-audit")
}

fn open_audit(config: &AppConfig) -> anyhow::Result<AuditLog> {
    match &config.audit.journal_path {
        Some(path) => AuditLog::open(path)
            .with_context(|| format!("Failed to open audit journal: {}", path.display())),
        None => {
            warn!("No audit journal configured, audit trail is memory-only");
            Ok(AuditLog::in_memory())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = txn_recovery::logging::init_logging(&app_config);

    info!("Starting txn_recovery in {} mode", env);

    let audit = Arc::new(open_audit(&app_config)?);
    match audit.verify() {
        Ok(count) => info!(entries = count, "Audit log verified"),
        Err(e) => {
            error!(error = %e, code = e.code(), "Audit log corrupted");
            return Ok(ExitCode::FAILURE);
        }
    }
    if verify_only() {
        return Ok(ExitCode::SUCCESS);
    }

    let (notifier, notifications) = notification_channel();
    let store = Arc::new(TransactionStateStore::new(audit.clone()).with_notifier(notifier.clone()));
    if app_config.audit.rehydrate_on_start {
        let restored = store.rehydrate().context("State rehydration failed")?;
        info!(restored, "Live state rebuilt from audit log");
    }

    let gateway = Arc::new(
        RpcLedgerGateway::new(&app_config.ledger.rpc_url, app_config.ledger.request_timeout())
            .context("Failed to create ledger gateway")?,
    );
    let orchestrator = RecoveryOrchestrator::new(store.clone(), gateway)
        .with_call_timeout(app_config.recovery.gateway_timeout())
        .with_notifier(notifier);
    info!(
        tracked = orchestrator.store().len(),
        rpc_url = %app_config.ledger.rpc_url,
        "Recovery orchestrator ready"
    );

    let resumed = orchestrator.resume_interrupted_rollbacks().await;
    if resumed > 0 {
        info!(resumed, "Interrupted rollbacks completed");
    }

    let dispatcher = NotificationDispatcher::new(notifications, Arc::new(LoggingSink));
    let dispatcher_handle = tokio::spawn(dispatcher.run());

    let worker = RetentionWorker::new(
        store.clone(),
        RetentionConfig {
            scan_interval: app_config.recovery.sweep_interval(),
            retention: app_config.recovery.retention(),
        },
    );

    tokio::select! {
        _ = worker.run() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
    }

    // Dropping the last senders lets the dispatcher drain and stop
    drop(worker);
    drop(orchestrator);
    drop(store);
    match dispatcher_handle.await {
        Ok(delivered) => info!(delivered, "Notifications flushed"),
        Err(e) => warn!(error = %e, "Notification dispatcher aborted"),
    }

    info!(entries = audit.len(), "txn_recovery stopped");
    Ok(ExitCode::SUCCESS)
}
