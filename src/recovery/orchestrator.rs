//! Recovery Orchestrator
//!
//! Drives one logical recovery operation per call: check the current state,
//! make a single gateway call, then commit the transition that reflects the
//! outcome.
//!
//! # Safety Invariants
//!
//! 1. **No lock across I/O**: the store lock is never held while a gateway
//!    call is in flight.
//! 2. **Outcome before transition**: a forward or `Error` transition is only
//!    committed once the ledger gave a definite answer (or the call timed
//!    out). A caller that drops the future mid-call leaves state unchanged.
//! 3. **Persist-before-call for rollback**: `RollbackInitiated` is committed
//!    before the compensating call, so an interrupted rollback can resume.
//! 4. **One attempt per call**: retries, backoff and attempt limits belong
//!    to the caller.
//! 5. **One operation per id**: a state-changing operation claims its id for
//!    the whole check, call and commit sequence. A concurrent operation on
//!    the same id fails with `InFlight` before reaching the ledger.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::audit::{AuditLog, AuditLogEntry, event};
use super::error::{RecoveryError, TransactionError};
use super::gateway::LedgerGateway;
use super::notify::{Notification, NotificationKind, NotificationSender};
use super::state::{StateTag, TerminalOutcome, TransactionState};
use super::store::{TransactionStateStore, meta};
use super::types::{
    LedgerTransaction, Metadata, Operation, OperationResult, RecoveryRequest, TransactionId,
};

/// Default bound on a single gateway call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RecoveryOrchestrator {
    store: Arc<TransactionStateStore>,
    audit: Arc<AuditLog>,
    gateway: Arc<dyn LedgerGateway>,
    notifier: Option<NotificationSender>,
    call_timeout: Duration,
    in_flight: Mutex<HashSet<TransactionId>>,
}

/// Releases an id claimed by `RecoveryOrchestrator::claim`, also when the
/// operation future is dropped mid-call
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<TransactionId>>,
    id: TransactionId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl RecoveryOrchestrator {
    pub fn new(store: Arc<TransactionStateStore>, gateway: Arc<dyn LedgerGateway>) -> Self {
        let audit = store.audit().clone();
        Self {
            store,
            audit,
            gateway,
            notifier: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Emit `ActionRequired` notifications for manual-intervention events
    pub fn with_notifier(mut self, notifier: NotificationSender) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Arc<TransactionStateStore> {
        &self.store
    }

    pub fn current_state(&self, id: &TransactionId) -> Option<TransactionState> {
        self.store.current_state(id)
    }

    /// Register a new transaction in `Initial`
    pub fn register(&self, id: &TransactionId) -> Result<(), RecoveryError> {
        if self.store.current_state(id).is_some() {
            return Err(RecoveryError::AlreadyRegistered(id.to_string()));
        }
        self.store.transition(
            id,
            TransactionState::Initial,
            Metadata::new().with("operation", "REGISTER"),
        )?;
        Ok(())
    }

    /// Initial -> Processing
    pub async fn submit_transaction(
        &self,
        req: &RecoveryRequest,
    ) -> Result<OperationResult, RecoveryError> {
        let op = Operation::Submit;
        let _claim = self.claim(op, &req.transaction_id)?;
        let current = self.require(op, req, |s| matches!(s, TransactionState::Initial))?;

        match self.call(op, self.gateway.submit(req)).await {
            Ok(receipt) => {
                let next = TransactionState::Processing {
                    progress: 100,
                    message: format!("Broadcast as {}", receipt.tx_hash),
                };
                self.advance(op, req, next, Some(receipt.tx_hash), req.recovery_attempt_count)
            }
            Err(e) => Err(self.record_failure(op, req, &current, e)),
        }
    }

    /// Error{recoverable} -> Processing
    ///
    /// The request's attempt count is incremented before the call; the
    /// result carries the new count for the caller's next attempt.
    pub async fn retry_transaction(
        &self,
        req: &RecoveryRequest,
    ) -> Result<OperationResult, RecoveryError> {
        let op = Operation::Retry;
        let _claim = self.claim(op, &req.transaction_id)?;
        let current = self.require(op, req, |s| {
            matches!(
                s,
                TransactionState::Error {
                    recoverable: true,
                    ..
                }
            )
        })?;

        let attempt = req.clone().with_attempts(req.recovery_attempt_count + 1);
        match self.call(op, self.gateway.retry(&attempt)).await {
            Ok(receipt) => {
                let next = TransactionState::Processing {
                    progress: 100,
                    message: format!(
                        "Rebroadcast as {} (attempt {})",
                        receipt.tx_hash, attempt.recovery_attempt_count
                    ),
                };
                self.advance(
                    op,
                    &attempt,
                    next,
                    Some(receipt.tx_hash),
                    attempt.recovery_attempt_count,
                )
            }
            Err(e) => Err(self.record_failure(op, &attempt, &current, e)),
        }
    }

    /// Processing -> Verifying
    pub async fn verify_transaction(
        &self,
        req: &RecoveryRequest,
    ) -> Result<OperationResult, RecoveryError> {
        let op = Operation::Verify;
        let _claim = self.claim(op, &req.transaction_id)?;
        let current = self.require(op, req, |s| {
            matches!(s, TransactionState::Processing { .. })
        })?;

        match self.call(op, self.gateway.verify(req)).await {
            Ok(report) => {
                let next = TransactionState::Verifying {
                    stage: report.stage,
                    progress: report.progress.min(100),
                };
                self.advance(op, req, next, None, req.recovery_attempt_count)
            }
            Err(e) => Err(self.record_failure(op, req, &current, e)),
        }
    }

    /// Verifying -> Confirmed, or Error{Validation} on a negative verdict
    pub async fn validate_transaction(
        &self,
        req: &RecoveryRequest,
    ) -> Result<OperationResult, RecoveryError> {
        let op = Operation::Validate;
        let _claim = self.claim(op, &req.transaction_id)?;
        let current = self.require(op, req, |s| {
            matches!(s, TransactionState::Verifying { .. })
        })?;

        match self.call(op, self.gateway.validate(req)).await {
            Ok(report) if report.valid => self.advance(
                op,
                req,
                TransactionState::Confirmed,
                None,
                req.recovery_attempt_count,
            ),
            Ok(report) => {
                let reason = report
                    .reason
                    .unwrap_or_else(|| "ledger rejected the transaction".to_string());
                Err(self.record_failure(op, req, &current, TransactionError::validation(reason)))
            }
            Err(e) => Err(self.record_failure(op, req, &current, e)),
        }
    }

    /// Confirmed -> Terminal{Success}
    pub async fn finalize_transaction(
        &self,
        req: &RecoveryRequest,
    ) -> Result<OperationResult, RecoveryError> {
        let op = Operation::Finalize;
        let _claim = self.claim(op, &req.transaction_id)?;
        let current = self.require(op, req, |s| matches!(s, TransactionState::Confirmed))?;

        match self.call(op, self.gateway.finalize(req)).await {
            Ok(receipt) => {
                let next = TransactionState::terminal(
                    TerminalOutcome::Success,
                    format!("Finalized as {}", receipt.tx_hash),
                );
                self.advance(op, req, next, Some(receipt.tx_hash), req.recovery_attempt_count)
            }
            Err(e) => Err(self.record_failure(op, req, &current, e)),
        }
    }

    /// Error | RollbackInitiated -> RollbackInitiated -> RollbackInProgress -> Terminal{RolledBack}
    ///
    /// A failed compensating call ends in `Terminal{Failure}` and raises
    /// `MANUAL_INTERVENTION_REQUIRED`.
    pub async fn rollback_transaction(
        &self,
        req: &RecoveryRequest,
    ) -> Result<OperationResult, RecoveryError> {
        let op = Operation::Rollback;
        let _claim = self.claim(op, &req.transaction_id)?;
        let current = self.require(op, req, |s| {
            matches!(
                s,
                TransactionState::Error { .. } | TransactionState::RollbackInitiated
            )
        })?;

        // Persist intent before calling the ledger
        if let TransactionState::Error { error, .. } = &current {
            self.store.transition(
                &req.transaction_id,
                TransactionState::RollbackInitiated,
                op_metadata(op, req)
                    .with(meta::REASON, error.message())
                    .with(meta::ERROR_CODE, error.code()),
            )?;
        }

        match self.call(op, self.gateway.rollback(req)).await {
            Ok(receipt) => {
                self.store.transition(
                    &req.transaction_id,
                    TransactionState::RollbackInProgress,
                    op_metadata(op, req).with("tx_hash", receipt.tx_hash.as_str()),
                )?;
                let next = TransactionState::terminal(
                    TerminalOutcome::RolledBack,
                    format!("Rolled back by {}", receipt.tx_hash),
                );
                self.advance(op, req, next, Some(receipt.tx_hash), req.recovery_attempt_count)
            }
            Err(e) => {
                let reason = format!(
                    "Rollback failed: {}. Next step: {}",
                    e,
                    e.suggested_action()
                );
                self.store.transition(
                    &req.transaction_id,
                    TransactionState::terminal(TerminalOutcome::Failure, reason.as_str()),
                    failure_metadata(op, req, &e),
                )?;
                self.require_manual_intervention(req, &e, &reason)?;
                Err(RecoveryError::Ledger(e))
            }
        }
    }

    /// Look the transaction up on the ledger; no state change
    pub async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<LedgerTransaction, RecoveryError> {
        let tx = self
            .call_named("GET_TRANSACTION", self.gateway.get_transaction(id))
            .await?;
        Ok(tx)
    }

    /// Resume every rollback left in `RollbackInitiated` by a previous run
    ///
    /// The wallet address and attempt count come from the audit entry that
    /// committed `RollbackInitiated`. Returns how many rollbacks completed.
    pub async fn resume_interrupted_rollbacks(&self) -> usize {
        let pending = self.store.ids_in_state(StateTag::RollbackInitiated);
        if pending.is_empty() {
            return 0;
        }

        let latest = match self
            .audit
            .latest_by_transaction(event::TRANSACTION_STATE_UPDATED)
        {
            Ok(latest) => latest,
            Err(e) => {
                error!(error = %e, "Cannot read audit trail to resume rollbacks");
                return 0;
            }
        };

        info!(count = pending.len(), "Resuming interrupted rollbacks");
        let mut resumed = 0;
        for id in pending {
            let Some(entry) = latest.get(&id) else {
                warn!(txn_id = %id, "No audit entry for interrupted rollback, skipping");
                continue;
            };
            let wallet = entry.metadata().get(meta::WALLET_ADDRESS).unwrap_or_default();
            let attempts = entry
                .metadata()
                .get("recovery_attempts")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let req = RecoveryRequest::new(id.clone(), wallet).with_attempts(attempts);

            match self.rollback_transaction(&req).await {
                Ok(_) => resumed += 1,
                Err(e) => warn!(
                    txn_id = %id,
                    code = e.code(),
                    error = %e,
                    "Interrupted rollback did not complete"
                ),
            }
        }
        resumed
    }

    /// Mark `id` busy until the returned guard drops
    fn claim(&self, op: Operation, id: &TransactionId) -> Result<InFlightGuard<'_>, RecoveryError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(id.clone()) {
            debug!(txn_id = %id, operation = op.as_str(), "Operation already in flight");
            return Err(RecoveryError::InFlight {
                operation: op.as_str(),
                id: id.to_string(),
            });
        }
        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            id: id.clone(),
        })
    }

    /// Current state if `allowed`, otherwise reject before any gateway call
    fn require(
        &self,
        op: Operation,
        req: &RecoveryRequest,
        allowed: impl Fn(&TransactionState) -> bool,
    ) -> Result<TransactionState, RecoveryError> {
        let current = self
            .store
            .current_state(&req.transaction_id)
            .ok_or_else(|| RecoveryError::NotRegistered(req.transaction_id.to_string()))?;

        if !allowed(&current) {
            warn!(
                txn_id = %req.transaction_id,
                operation = op.as_str(),
                state = %current.tag(),
                "Operation rejected by precondition"
            );
            return Err(RecoveryError::OperationNotAllowed {
                operation: op.as_str(),
                state: current.tag(),
            });
        }
        Ok(current)
    }

    async fn call<T, F>(&self, op: Operation, fut: F) -> Result<T, TransactionError>
    where
        F: Future<Output = Result<T, TransactionError>>,
    {
        self.call_named(op.as_str(), fut).await
    }

    /// Single bounded gateway call; elapsed deadline becomes `Timeout`
    async fn call_named<T, F>(&self, name: &str, fut: F) -> Result<T, TransactionError>
    where
        F: Future<Output = Result<T, TransactionError>>,
    {
        debug!(
            gateway = self.gateway.name(),
            operation = name,
            timeout_ms = self.call_timeout.as_millis() as u64,
            "Ledger call"
        );
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransactionError::timeout(format!(
                "{} did not complete within {}ms",
                name,
                self.call_timeout.as_millis()
            ))),
        }
    }

    fn advance(
        &self,
        op: Operation,
        req: &RecoveryRequest,
        next: TransactionState,
        tx_hash: Option<String>,
        recovery_attempt_count: u32,
    ) -> Result<OperationResult, RecoveryError> {
        let mut metadata = op_metadata(op, req);
        if let Some(ref hash) = tx_hash {
            metadata.insert("tx_hash", hash.as_str());
        }
        self.store
            .transition(&req.transaction_id, next.clone(), metadata)?;

        info!(
            txn_id = %req.transaction_id,
            operation = op.as_str(),
            state = %next.tag(),
            "Recovery operation completed"
        );

        Ok(OperationResult {
            transaction_id: req.transaction_id.clone(),
            operation: op,
            state: next,
            tx_hash,
            recovery_attempt_count,
            completed_at: Utc::now(),
        })
    }

    /// Audit a gateway failure and move to `Error` when that edge exists
    ///
    /// Returns the error for the caller. An audit failure while recording
    /// takes precedence, since the trail must not silently lose entries.
    fn record_failure(
        &self,
        op: Operation,
        req: &RecoveryRequest,
        current: &TransactionState,
        err: TransactionError,
    ) -> RecoveryError {
        warn!(
            txn_id = %req.transaction_id,
            operation = op.as_str(),
            code = err.code(),
            recoverable = err.is_recoverable(),
            error = %err,
            "Ledger call failed"
        );

        let recorded = if current.tag().can_transition_to(StateTag::Error) {
            self.store
                .transition(
                    &req.transaction_id,
                    TransactionState::error(err.clone()),
                    failure_metadata(op, req, &err),
                )
                .map_err(RecoveryError::from)
        } else {
            let mut metadata = failure_metadata(op, req, &err);
            metadata.insert("state", current.tag().as_str());
            self.audit
                .append(AuditLogEntry::new(
                    event::RECOVERY_ACTION_FAILED,
                    Some(req.transaction_id.clone()),
                    format!("{} failed in {}: {}", op, current.tag(), err),
                    metadata,
                ))
                .map(|_| ())
                .map_err(RecoveryError::from)
        };

        match recorded {
            Ok(()) => RecoveryError::Ledger(err),
            Err(record_err) => {
                error!(
                    txn_id = %req.transaction_id,
                    operation = op.as_str(),
                    ledger_error = %err,
                    error = %record_err,
                    "Failed to record ledger failure"
                );
                record_err
            }
        }
    }

    fn require_manual_intervention(
        &self,
        req: &RecoveryRequest,
        err: &TransactionError,
        reason: &str,
    ) -> Result<(), RecoveryError> {
        let payload = Metadata::new()
            .with(meta::ERROR_CODE, err.code())
            .with(meta::REASON, reason)
            .with(meta::SUGGESTED_ACTION, err.suggested_action())
            .with(meta::WALLET_ADDRESS, req.wallet_address.as_str());

        self.audit.append(AuditLogEntry::new(
            event::MANUAL_INTERVENTION_REQUIRED,
            Some(req.transaction_id.clone()),
            reason,
            payload.clone(),
        ))?;

        error!(
            txn_id = %req.transaction_id,
            code = err.code(),
            "Manual intervention required"
        );

        if let Some(ref notifier) = self.notifier {
            notifier.send(Notification::new(
                req.transaction_id.clone(),
                NotificationKind::ActionRequired,
                payload,
            ));
        }
        Ok(())
    }
}

fn op_metadata(op: Operation, req: &RecoveryRequest) -> Metadata {
    Metadata::new()
        .with("operation", op.as_str())
        .with("recovery_attempts", req.recovery_attempt_count.to_string())
        .with(meta::WALLET_ADDRESS, req.wallet_address.as_str())
}

fn failure_metadata(op: Operation, req: &RecoveryRequest, err: &TransactionError) -> Metadata {
    let mut metadata = op_metadata(op, req)
        .with(meta::ERROR_CODE, err.code())
        .with("recoverable", err.is_recoverable().to_string())
        .with(meta::REASON, err.message())
        .with(meta::SUGGESTED_ACTION, err.suggested_action());
    if let Some(cause) = err.cause() {
        metadata.insert("cause", cause);
    }
    metadata
}
