//! Integration Tests for the recovery engine
//!
//! Drive the orchestrator end to end against the scriptable `MockLedger`,
//! checking state, audit trail and notifications together.

use std::sync::Arc;
use std::time::Duration;

use crate::recovery::audit::{AuditFilter, AuditLog, event};
use crate::recovery::error::{RecoveryError, TransactionError};
use crate::recovery::gateway::MockLedger;
use crate::recovery::notify::{NotificationKind, notification_channel};
use crate::recovery::orchestrator::RecoveryOrchestrator;
use crate::recovery::state::{StateTag, TerminalOutcome, TransactionState, VerificationStage};
use crate::recovery::store::TransactionStateStore;
use crate::recovery::types::{Operation, RecoveryRequest, TransactionId, VerificationReport};

/// Helper to wire an orchestrator over in-memory audit and a mock ledger
struct TestHarness {
    orchestrator: RecoveryOrchestrator,
    store: Arc<TransactionStateStore>,
    audit: Arc<AuditLog>,
    ledger: Arc<MockLedger>,
}

impl TestHarness {
    fn new() -> Self {
        let audit = Arc::new(AuditLog::in_memory());
        let store = Arc::new(TransactionStateStore::new(audit.clone()));
        let ledger = Arc::new(MockLedger::new());
        let orchestrator = RecoveryOrchestrator::new(store.clone(), ledger.clone());
        Self {
            orchestrator,
            store,
            audit,
            ledger,
        }
    }

    fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator = self.orchestrator.with_call_timeout(timeout);
        self
    }

    fn registered(&self, id: &str) -> RecoveryRequest {
        let req = RecoveryRequest::new(id, "0x71C7656EC7ab88b098defB751B7401B5f6d8976F");
        self.orchestrator.register(&req.transaction_id).unwrap();
        req
    }

    fn state(&self, req: &RecoveryRequest) -> TransactionState {
        self.store.current_state(&req.transaction_id).unwrap()
    }

    fn events(&self, event_type: &str) -> usize {
        self.audit
            .query(&AuditFilter::by_event_type(event_type), 1_000, None)
            .unwrap()
            .entries
            .len()
    }
}

// ========================================================================
// Happy Path
// ========================================================================

/// Flow: INITIAL → PROCESSING → VERIFYING → CONFIRMED → TERMINAL{Success}
#[tokio::test]
async fn test_full_lifecycle_to_success() {
    let h = TestHarness::new();
    let req = h.registered("txn-happy");

    h.orchestrator.submit_transaction(&req).await.unwrap();
    let verified = h.orchestrator.verify_transaction(&req).await.unwrap();
    assert_eq!(
        verified.state,
        TransactionState::Verifying {
            stage: VerificationStage::SmartContract,
            progress: 100,
        }
    );
    h.orchestrator.validate_transaction(&req).await.unwrap();
    let done = h.orchestrator.finalize_transaction(&req).await.unwrap();

    assert!(matches!(
        done.state,
        TransactionState::Terminal {
            outcome: TerminalOutcome::Success,
            ..
        }
    ));
    assert_eq!(done.tx_hash.as_deref(), Some("0xtxn-happy-finalize"));

    // One audit entry per accepted transition
    let trail = h
        .audit
        .query(&AuditFilter::by_transaction("txn-happy"), 100, None)
        .unwrap();
    assert_eq!(trail.entries.len(), 5);
    assert_eq!(trail.entries[0].metadata().get("new_state"), Some("TERMINAL"));
    assert_eq!(trail.entries[4].metadata().get("new_state"), Some("INITIAL"));
    assert_eq!(h.audit.verify().unwrap(), 5);
}

#[tokio::test]
async fn test_verification_progress_from_ledger() {
    let h = TestHarness::new();
    let req = h.registered("txn-poll");
    h.ledger.set_verification(VerificationReport {
        stage: VerificationStage::BlockchainState,
        progress: 40,
    });

    h.orchestrator.submit_transaction(&req).await.unwrap();
    h.orchestrator.verify_transaction(&req).await.unwrap();
    assert_eq!(
        h.state(&req),
        TransactionState::Verifying {
            stage: VerificationStage::BlockchainState,
            progress: 40,
        }
    );

    // Finalize is only legal from CONFIRMED
    let err = h.orchestrator.finalize_transaction(&req).await.unwrap_err();
    assert!(matches!(
        err,
        RecoveryError::OperationNotAllowed {
            operation: "FINALIZE",
            state: StateTag::Verifying,
        }
    ));
    assert_eq!(h.ledger.calls(Operation::Finalize), 0);
}

// ========================================================================
// Failure & Retry
// ========================================================================

/// Rollback while PROCESSING is rejected before touching the ledger
#[tokio::test]
async fn test_rollback_from_processing_rejected() {
    let h = TestHarness::new();
    let req = h.registered("txn-early-rollback");
    h.orchestrator.submit_transaction(&req).await.unwrap();
    let calls_before = h.ledger.total_calls();

    let err = h.orchestrator.rollback_transaction(&req).await.unwrap_err();

    assert!(matches!(
        err,
        RecoveryError::OperationNotAllowed {
            operation: "ROLLBACK",
            state: StateTag::Processing,
        }
    ));
    assert_eq!(h.ledger.total_calls(), calls_before);
    assert_eq!(h.ledger.calls(Operation::Rollback), 0);
    assert_eq!(h.state(&req).tag(), StateTag::Processing);
}

/// Gateway timeout → ERROR{Timeout, recoverable} → retry → PROCESSING
#[tokio::test(start_paused = true)]
async fn test_timeout_then_retry() {
    let h = TestHarness::new().with_call_timeout(Duration::from_secs(5));
    let req = h.registered("txn-slow");
    h.ledger.set_delay(Operation::Submit, Duration::from_secs(60));

    let err = h.orchestrator.submit_transaction(&req).await.unwrap_err();
    assert_eq!(err.code(), "TIMEOUT");
    assert!(err.ledger_error().unwrap().is_recoverable());
    match h.state(&req) {
        TransactionState::Error { error, recoverable } => {
            assert!(recoverable);
            assert!(matches!(error, TransactionError::Timeout { .. }));
        }
        other => panic!("expected ERROR, got {}", other),
    }

    let retried = h.orchestrator.retry_transaction(&req).await.unwrap();
    assert_eq!(retried.state.tag(), StateTag::Processing);
    assert_eq!(retried.recovery_attempt_count, 1);
}

#[tokio::test]
async fn test_failed_verify_records_error_with_reason() {
    let h = TestHarness::new();
    let req = h.registered("txn-reorg");
    h.orchestrator.submit_transaction(&req).await.unwrap();
    h.ledger.fail_next(
        Operation::Verify,
        TransactionError::blockchain("block reorganized").with_cause("depth 3"),
    );

    let err = h.orchestrator.verify_transaction(&req).await.unwrap_err();
    assert_eq!(err.code(), "BLOCKCHAIN_ERROR");

    let latest = h
        .audit
        .query(&AuditFilter::by_transaction("txn-reorg"), 1, None)
        .unwrap();
    let entry = &latest.entries[0];
    assert_eq!(entry.metadata().get("new_state"), Some("ERROR"));
    assert_eq!(entry.metadata().get("error_code"), Some("BLOCKCHAIN_ERROR"));
    assert_eq!(entry.metadata().get("cause"), Some("depth 3"));
    assert!(entry.metadata().get("suggested_action").is_some());
}

/// A failed finalize has no ERROR edge from CONFIRMED; state stays put
#[tokio::test]
async fn test_failure_without_error_edge_is_audited_only() {
    let h = TestHarness::new();
    let req = h.registered("txn-final");
    h.orchestrator.submit_transaction(&req).await.unwrap();
    h.orchestrator.verify_transaction(&req).await.unwrap();
    h.orchestrator.validate_transaction(&req).await.unwrap();

    h.ledger
        .fail_next(Operation::Finalize, TransactionError::network("peer dropped"));
    let err = h.orchestrator.finalize_transaction(&req).await.unwrap_err();

    assert_eq!(err.code(), "NETWORK_ERROR");
    assert_eq!(h.state(&req), TransactionState::Confirmed);
    assert_eq!(h.events(event::RECOVERY_ACTION_FAILED), 1);

    // Still finalizable
    h.orchestrator.finalize_transaction(&req).await.unwrap();
}

// ========================================================================
// Rollback
// ========================================================================

#[tokio::test]
async fn test_rollback_walks_compensation_path() {
    let h = TestHarness::new();
    let req = h.registered("txn-rb");
    h.ledger.fail_next(
        Operation::Submit,
        TransactionError::insufficient_funds("balance 0.01 ETH"),
    );
    let _ = h.orchestrator.submit_transaction(&req).await;

    let result = h.orchestrator.rollback_transaction(&req).await.unwrap();
    assert!(matches!(
        result.state,
        TransactionState::Terminal {
            outcome: TerminalOutcome::RolledBack,
            ..
        }
    ));

    let tags: Vec<String> = h
        .audit
        .query(&AuditFilter::by_transaction("txn-rb"), 100, None)
        .unwrap()
        .entries
        .iter()
        .rev()
        .map(|e| e.metadata().get("new_state").unwrap_or("").to_string())
        .collect();
    assert_eq!(
        tags,
        vec![
            "INITIAL",
            "ERROR",
            "ROLLBACK_INITIATED",
            "ROLLBACK_IN_PROGRESS",
            "TERMINAL"
        ]
    );
    assert_eq!(h.events(event::MANUAL_INTERVENTION_REQUIRED), 0);
}

#[tokio::test]
async fn test_failed_rollback_requires_manual_intervention() {
    let (tx, mut rx) = notification_channel();
    let mut h = TestHarness::new();
    h.orchestrator = h.orchestrator.with_notifier(tx);

    let req = h.registered("txn-stuck");
    h.ledger
        .fail_next(Operation::Submit, TransactionError::wallet("wallet locked"));
    let _ = h.orchestrator.submit_transaction(&req).await;
    h.ledger.fail_next(
        Operation::Rollback,
        TransactionError::blockchain("compensation reverted"),
    );

    let err = h.orchestrator.rollback_transaction(&req).await.unwrap_err();
    assert_eq!(err.code(), "BLOCKCHAIN_ERROR");

    match h.state(&req) {
        TransactionState::Terminal {
            outcome, message, ..
        } => {
            assert_eq!(outcome, TerminalOutcome::Failure);
            assert!(message.contains("compensation reverted"));
        }
        other => panic!("expected TERMINAL, got {}", other),
    }

    let page = h
        .audit
        .query(
            &AuditFilter::by_event_type(event::MANUAL_INTERVENTION_REQUIRED),
            10,
            None,
        )
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert!(page.entries[0].metadata().get("reason").is_some());
    assert!(page.entries[0].metadata().get("suggested_action").is_some());

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.kind, NotificationKind::ActionRequired);
    assert_eq!(notice.transaction_id, req.transaction_id);

    // Terminal is absorbing
    let err = h.orchestrator.rollback_transaction(&req).await.unwrap_err();
    assert!(matches!(err, RecoveryError::OperationNotAllowed { .. }));
}

/// Caller cancels mid-rollback; intent is persisted and the rollback resumes
#[tokio::test(start_paused = true)]
async fn test_cancelled_rollback_resumes() {
    let h = TestHarness::new();
    let req = h.registered("txn-cancel");
    h.ledger
        .fail_next(Operation::Submit, TransactionError::validation("bad nonce"));
    let _ = h.orchestrator.submit_transaction(&req).await;

    h.ledger.set_delay(Operation::Rollback, Duration::from_secs(10));
    let cancelled = tokio::time::timeout(
        Duration::from_secs(1),
        h.orchestrator.rollback_transaction(&req),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(h.state(&req), TransactionState::RollbackInitiated);

    h.ledger.set_delay(Operation::Rollback, Duration::ZERO);
    let result = h.orchestrator.rollback_transaction(&req).await.unwrap();
    assert_eq!(result.state.tag(), StateTag::Terminal);
    assert_eq!(h.ledger.calls(Operation::Rollback), 2);
}

/// Startup sweep picks up rollbacks stranded in ROLLBACK_INITIATED
#[tokio::test(start_paused = true)]
async fn test_resume_interrupted_rollbacks() {
    let h = TestHarness::new();
    let stranded = h.registered("txn-stranded").with_attempts(2);
    let untouched = h.registered("txn-untouched");
    h.ledger
        .fail_next(Operation::Submit, TransactionError::wallet("locked"));
    let _ = h.orchestrator.submit_transaction(&stranded).await;

    h.ledger.set_delay(Operation::Rollback, Duration::from_secs(10));
    let cancelled = tokio::time::timeout(
        Duration::from_secs(1),
        h.orchestrator.rollback_transaction(&stranded),
    )
    .await;
    assert!(cancelled.is_err());
    h.ledger.set_delay(Operation::Rollback, Duration::ZERO);

    assert_eq!(h.orchestrator.resume_interrupted_rollbacks().await, 1);
    match h.state(&stranded) {
        TransactionState::Terminal { outcome, .. } => {
            assert_eq!(outcome, TerminalOutcome::RolledBack)
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(h.state(&untouched), TransactionState::Initial);
    assert_eq!(h.ledger.last_attempts(), 2);

    // Request rebuilt from the audit trail
    let trail = h
        .audit
        .query(&AuditFilter::by_transaction("txn-stranded"), 1, None)
        .unwrap();
    assert_eq!(
        trail.entries[0].metadata().get("wallet_address"),
        Some("0x71C7656EC7ab88b098defB751B7401B5f6d8976F")
    );

    // Nothing left to resume
    assert_eq!(h.orchestrator.resume_interrupted_rollbacks().await, 0);
}

// ========================================================================
// Concurrency
// ========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_keep_total_order() {
    let h = Arc::new(TestHarness::new());
    let ids: Vec<String> = (0..32).map(|i| format!("txn-par-{}", i)).collect();
    for id in &ids {
        h.registered(id);
    }

    let handles = ids.iter().map(|id| {
        let h = h.clone();
        let req = RecoveryRequest::new(id.as_str(), "0xabc");
        tokio::spawn(async move {
            h.orchestrator.submit_transaction(&req).await?;
            h.orchestrator.verify_transaction(&req).await
        })
    });
    let results = futures::future::join_all(handles).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap().state.tag(), StateTag::Verifying);
    }
    assert_eq!(h.store.ids_in_state(StateTag::Verifying).len(), 32);
    // 32 registrations + 64 forward transitions, contiguous sequence
    assert_eq!(h.audit.verify().unwrap(), 96);
}

/// Overlapping submits on one id: the first claims it, the rest bounce
/// before reaching the ledger
#[tokio::test(start_paused = true)]
async fn test_racing_submits_accept_exactly_one() {
    let h = TestHarness::new();
    let req = h.registered("txn-race");
    h.ledger.set_delay(Operation::Submit, Duration::from_millis(10));

    let results = futures::future::join_all(
        (0..4).map(|_| h.orchestrator.submit_transaction(&req)),
    )
    .await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let bounced = results
        .iter()
        .filter(|r| matches!(r, Err(RecoveryError::InFlight { .. })))
        .count();
    assert_eq!(bounced, 3);
    assert_eq!(h.ledger.calls(Operation::Submit), 1);
    assert_eq!(h.state(&req).tag(), StateTag::Processing);

    let trail = h
        .audit
        .query(
            &AuditFilter::by_transaction(TransactionId::from("txn-race")),
            100,
            None,
        )
        .unwrap();
    let accepted = trail
        .entries
        .iter()
        .filter(|e| e.event_type() == event::TRANSACTION_STATE_UPDATED)
        .count();
    assert_eq!(accepted, 2);
    assert!(
        trail
            .entries
            .iter()
            .all(|e| e.event_type() != event::RECOVERY_ACTION_FAILED)
    );
}

/// Rollback issued while a retry is in flight is turned away untouched
#[tokio::test(start_paused = true)]
async fn test_in_flight_blocks_other_operations_on_same_id() {
    let h = TestHarness::new();
    let req = h.registered("txn-overlap");
    h.ledger
        .fail_next(Operation::Submit, TransactionError::network("reset"));
    let _ = h.orchestrator.submit_transaction(&req).await;

    h.ledger.set_delay(Operation::Retry, Duration::from_millis(10));
    let (retried, rolled_back) = tokio::join!(
        h.orchestrator.retry_transaction(&req),
        h.orchestrator.rollback_transaction(&req),
    );

    assert_eq!(retried.unwrap().state.tag(), StateTag::Processing);
    assert_eq!(rolled_back.unwrap_err().code(), "OPERATION_IN_FLIGHT");
    assert_eq!(h.ledger.calls(Operation::Rollback), 0);

    // Claim released; the next operation goes through
    h.ledger.set_delay(Operation::Retry, Duration::ZERO);
    let result = h.orchestrator.verify_transaction(&req).await.unwrap();
    assert_eq!(result.state.tag(), StateTag::Verifying);
}
