use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use txn_recovery::recovery::audit::event;
use txn_recovery::recovery::{
    AuditFilter, AuditLog, LedgerGateway, LedgerReceipt, LedgerTransaction, Metadata,
    RecoveryError, RecoveryOrchestrator, RecoveryRequest, StateTag, TerminalOutcome,
    TransactionError, TransactionId, TransactionState, TransactionStateStore, TransitionError,
    ValidationReport, VerificationReport, VerificationStage,
};

/// Ledger that answers everything, optionally hanging on submit
#[derive(Default)]
struct StubLedger {
    hang_submit: AtomicBool,
    calls: AtomicUsize,
}

impl StubLedger {
    fn receipt(req: &RecoveryRequest) -> LedgerReceipt {
        LedgerReceipt {
            tx_hash: format!("0xstub-{}", req.transaction_id),
            message: "ok".to_string(),
        }
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerGateway for StubLedger {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn submit(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.enter().await;
        if self.hang_submit.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(Self::receipt(req))
    }

    async fn retry(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.enter().await;
        Ok(Self::receipt(req))
    }

    async fn verify(&self, _req: &RecoveryRequest) -> Result<VerificationReport, TransactionError> {
        self.enter().await;
        Ok(VerificationReport {
            stage: VerificationStage::BlockchainState,
            progress: 50,
        })
    }

    async fn rollback(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.enter().await;
        Ok(Self::receipt(req))
    }

    async fn validate(&self, _req: &RecoveryRequest) -> Result<ValidationReport, TransactionError> {
        self.enter().await;
        Ok(ValidationReport {
            valid: true,
            reason: None,
        })
    }

    async fn finalize(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.enter().await;
        Ok(Self::receipt(req))
    }

    async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<LedgerTransaction, TransactionError> {
        Err(TransactionError::validation(format!("unknown transaction {}", id)))
    }
}

fn new_store() -> Arc<TransactionStateStore> {
    Arc::new(TransactionStateStore::new(Arc::new(AuditLog::in_memory())))
}

fn journal_path(name: &str) -> String {
    format!("target/test_scenarios_{}_{}.log", name, std::process::id())
}

#[test]
fn scenario_lifecycle_then_terminal_is_absorbing() {
    let store = new_store();
    let id = TransactionId::from("txn-1");

    store
        .transition(&id, TransactionState::Initial, Metadata::new())
        .unwrap();
    store
        .transition(
            &id,
            TransactionState::Processing {
                progress: 10,
                message: "broadcasting".into(),
            },
            Metadata::new(),
        )
        .unwrap();
    store
        .transition(
            &id,
            TransactionState::Verifying {
                stage: VerificationStage::BlockchainState,
                progress: 0,
            },
            Metadata::new(),
        )
        .unwrap();
    store
        .transition(&id, TransactionState::Confirmed, Metadata::new())
        .unwrap();
    store
        .transition(
            &id,
            TransactionState::terminal(TerminalOutcome::Success, "settled"),
            Metadata::new(),
        )
        .unwrap();

    let err = store
        .transition(
            &id,
            TransactionState::Processing {
                progress: 0,
                message: "again".into(),
            },
            Metadata::new(),
        )
        .unwrap_err();
    assert!(matches!(err, TransitionError::TerminalStateViolation { .. }));
    assert_eq!(store.current_state(&id).unwrap().tag(), StateTag::Terminal);

    // 5 accepted + 1 rejected
    let trail = store
        .audit()
        .query(&AuditFilter::by_transaction("txn-1"), 100, None)
        .unwrap();
    assert_eq!(trail.entries.len(), 6);
    assert_eq!(trail.entries[0].event_type(), event::TRANSACTION_STATE_REJECTED);
}

#[test]
fn scenario_first_state_must_be_initial() {
    let store = new_store();
    for raw in ["a", "b", "c"] {
        let err = store
            .transition(
                &TransactionId::from(raw),
                TransactionState::Processing {
                    progress: 0,
                    message: String::new(),
                },
                Metadata::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidInitialState { .. }));
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn scenario_rollback_while_processing_never_reaches_ledger() {
    let ledger = Arc::new(StubLedger::default());
    let orchestrator = RecoveryOrchestrator::new(new_store(), ledger.clone());
    let req = RecoveryRequest::new(TransactionId::generate(), "0xfeed");

    orchestrator.register(&req.transaction_id).unwrap();
    orchestrator.submit_transaction(&req).await.unwrap();
    let calls = ledger.calls.load(Ordering::SeqCst);

    let err = orchestrator.rollback_transaction(&req).await.unwrap_err();
    assert_eq!(err.code(), "OPERATION_NOT_ALLOWED");
    assert_eq!(ledger.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test(start_paused = true)]
async fn scenario_timeout_is_recoverable_and_retryable() {
    let ledger = Arc::new(StubLedger::default());
    ledger.hang_submit.store(true, Ordering::SeqCst);
    let orchestrator = RecoveryOrchestrator::new(new_store(), ledger.clone())
        .with_call_timeout(Duration::from_secs(30));
    let req = RecoveryRequest::new("txn-timeout", "0xfeed");
    orchestrator.register(&req.transaction_id).unwrap();

    let err = orchestrator.submit_transaction(&req).await.unwrap_err();
    assert!(matches!(
        err.ledger_error(),
        Some(TransactionError::Timeout { .. })
    ));
    assert!(matches!(
        orchestrator.current_state(&req.transaction_id),
        Some(TransactionState::Error {
            recoverable: true,
            ..
        })
    ));

    let result = orchestrator.retry_transaction(&req).await.unwrap();
    assert_eq!(result.state.tag(), StateTag::Processing);
}

#[tokio::test]
async fn scenario_lookup_errors_are_typed() {
    let orchestrator = RecoveryOrchestrator::new(new_store(), Arc::new(StubLedger::default()));
    let err = orchestrator
        .get_transaction(&TransactionId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::Ledger(TransactionError::Validation { .. })));
}

#[test]
fn scenario_sweep_is_idempotent() {
    let store = new_store();
    for raw in ["old-1", "old-2", "live"] {
        let id = TransactionId::from(raw);
        store
            .transition(&id, TransactionState::Initial, Metadata::new())
            .unwrap();
        store
            .transition(
                &id,
                TransactionState::error(TransactionError::unknown("stuck")),
                Metadata::new(),
            )
            .unwrap();
        if raw != "live" {
            store
                .transition(
                    &id,
                    TransactionState::terminal(TerminalOutcome::Failure, "given up"),
                    Metadata::new(),
                )
                .unwrap();
        }
    }

    let mut first = store.sweep(Duration::ZERO).unwrap();
    first.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(
        first,
        vec![TransactionId::from("old-1"), TransactionId::from("old-2")]
    );
    assert!(store.sweep(Duration::ZERO).unwrap().is_empty());

    // The audit trail for swept ids stays
    let trail = store
        .audit()
        .query(&AuditFilter::by_transaction("old-1"), 10, None)
        .unwrap();
    assert_eq!(trail.entries.len(), 3);
}

#[test]
fn scenario_restart_rehydrates_from_journal() {
    let path = journal_path("restart");
    let _ = std::fs::remove_file(&path);
    let id = TransactionId::from("txn-durable");

    {
        let audit = Arc::new(AuditLog::open(&path).unwrap());
        let store = TransactionStateStore::new(audit);
        store
            .transition(&id, TransactionState::Initial, Metadata::new())
            .unwrap();
        store
            .transition(
                &id,
                TransactionState::error(TransactionError::network("node down")),
                Metadata::new(),
            )
            .unwrap();
    }

    let audit = Arc::new(AuditLog::open(&path).unwrap());
    assert_eq!(audit.verify().unwrap(), 2);
    let store = TransactionStateStore::new(audit);
    assert_eq!(store.rehydrate().unwrap(), 1);
    assert!(matches!(
        store.current_state(&id),
        Some(TransactionState::Error {
            recoverable: true,
            ..
        })
    ));

    // Appends continue the sequence after replay
    store
        .transition(&id, TransactionState::RollbackInitiated, Metadata::new())
        .unwrap();
    assert_eq!(store.audit().verify().unwrap(), 3);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn scenario_restart_resumes_stranded_rollback() {
    let path = journal_path("stranded");
    let _ = std::fs::remove_file(&path);
    let id = TransactionId::from("txn-stranded");

    {
        let audit = Arc::new(AuditLog::open(&path).unwrap());
        let store = TransactionStateStore::new(audit);
        store
            .transition(&id, TransactionState::Initial, Metadata::new())
            .unwrap();
        store
            .transition(
                &id,
                TransactionState::error(TransactionError::wallet("locked")),
                Metadata::new(),
            )
            .unwrap();
        // Process dies after persisting intent, before the ledger answers
        store
            .transition(
                &id,
                TransactionState::RollbackInitiated,
                Metadata::new()
                    .with("wallet_address", "0xfeed")
                    .with("recovery_attempts", "1"),
            )
            .unwrap();
    }

    let audit = Arc::new(AuditLog::open(&path).unwrap());
    let store = Arc::new(TransactionStateStore::new(audit));
    assert_eq!(store.rehydrate().unwrap(), 1);

    let ledger = Arc::new(StubLedger::default());
    let orchestrator = RecoveryOrchestrator::new(store.clone(), ledger.clone());
    assert_eq!(orchestrator.resume_interrupted_rollbacks().await, 1);
    assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        store.current_state(&id),
        Some(TransactionState::Terminal {
            outcome: TerminalOutcome::RolledBack,
            ..
        })
    ));
    assert_eq!(store.audit().verify().unwrap(), 5);

    let _ = std::fs::remove_file(&path);
}
