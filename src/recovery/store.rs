//! Transaction State Store
//!
//! Holds the current state per transaction id and is the only place state
//! changes. One mutex guards the whole map so every transition, across all
//! ids, lands in a single total order.
//!
//! # Critical section
//!
//! ```text
//! lock map -> validate edge -> append audit entry -> mutate map -> publish snapshot -> unlock
//! ```
//!
//! The audit lock is only ever taken from inside this section, never the
//! other way round. Notifications go out after the map lock is released.
//!
//! # Blocking
//!
//! `transition`, `sweep` and `rehydrate` are synchronous. With a journal
//! backend the append waits for `fsync` while the map lock is held, so every
//! other transition waits with it. Async callers on a latency-sensitive
//! runtime should go through `tokio::task::spawn_blocking` or use the
//! memory backend.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::audit::{AuditFilter, AuditLog, AuditLogEntry, event};
use super::error::{AuditError, TransitionError};
use super::notify::{Notification, NotificationKind, NotificationSender};
use super::state::{StateTag, TransactionState};
use super::types::{Metadata, TransactionId};

/// Point-in-time view of every tracked transaction
pub type StateSnapshot = HashMap<TransactionId, TransactionState>;

/// Metadata keys the store writes on every transition entry
pub mod meta {
    pub const OLD_STATE: &str = "old_state";
    pub const NEW_STATE: &str = "new_state";
    /// JSON-encoded `TransactionState`, used for rehydration
    pub const STATE: &str = "state";
    pub const ERROR_CODE: &str = "error_code";
    pub const REASON: &str = "reason";
    pub const SUGGESTED_ACTION: &str = "suggested_action";
    pub const WALLET_ADDRESS: &str = "wallet_address";
    /// JSON array of ids removed by a retention sweep
    pub const SWEPT_IDS: &str = "ids";

    pub(crate) const NO_STATE: &str = "NONE";
}

pub struct TransactionStateStore {
    audit: Arc<AuditLog>,
    states: Mutex<StateSnapshot>,
    published: watch::Sender<Arc<StateSnapshot>>,
    notifier: Option<NotificationSender>,
}

impl TransactionStateStore {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        let (published, _) = watch::channel(Arc::new(StateSnapshot::new()));
        Self {
            audit,
            states: Mutex::new(StateSnapshot::new()),
            published,
            notifier: None,
        }
    }

    /// Emit a `StatusChanged` notification after every committed transition
    pub fn with_notifier(mut self, notifier: NotificationSender) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Apply `proposed` to `id` if the edge is legal
    ///
    /// The audit entry is written before the new state is visible to any
    /// reader. If the audit write fails, nothing changes.
    pub fn transition(
        &self,
        id: &TransactionId,
        proposed: TransactionState,
        metadata: Metadata,
    ) -> Result<(), TransitionError> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| TransitionError::StorePoisoned)?;

        let current = states.get(id);
        let from = current.map(|s| s.tag());
        let to = proposed.tag();

        if let Err(rejection) = check_edge(current, &proposed) {
            warn!(
                txn_id = %id,
                from = from.map(|t| t.as_str()).unwrap_or(meta::NO_STATE),
                to = %to,
                reason = rejection.code(),
                "Transition rejected"
            );
            self.audit_rejection(id, from, to, &rejection, metadata);
            return Err(rejection);
        }

        // === Write-ahead: audit first ===
        let entry = transition_entry(id, from, &proposed, metadata)?;
        self.audit.append(entry)?;

        let notice = self.notifier.as_ref().map(|_| status_notice(id, from, &proposed));
        states.insert(id.clone(), proposed);
        self.published.send_replace(Arc::new(states.clone()));
        drop(states);

        info!(
            txn_id = %id,
            from = from.map(|t| t.as_str()).unwrap_or(meta::NO_STATE),
            to = %to,
            "Transition committed"
        );

        if let (Some(notifier), Some(notice)) = (&self.notifier, notice) {
            notifier.send(notice);
        }
        Ok(())
    }

    pub fn current_state(&self, id: &TransactionId) -> Option<TransactionState> {
        self.published.borrow().get(id).cloned()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.published.borrow().clone()
    }

    /// Observe every snapshot the store publishes
    pub fn subscribe(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.published.subscribe()
    }

    pub fn ids_in_state(&self, tag: StateTag) -> HashSet<TransactionId> {
        self.published
            .borrow()
            .iter()
            .filter(|(_, state)| state.tag() == tag)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop `Terminal` entries older than `max_age` from active storage
    ///
    /// A `RETENTION_SWEEP` entry listing the removed ids is audited before
    /// they leave the map; the rest of their audit trail is untouched.
    /// Returns the removed ids.
    pub fn sweep(&self, max_age: Duration) -> Result<Vec<TransactionId>, TransitionError> {
        let now = Utc::now();
        let mut states = self
            .states
            .lock()
            .map_err(|_| TransitionError::StorePoisoned)?;

        let mut expired: Vec<TransactionId> = states
            .iter()
            .filter(|(_, state)| {
                state
                    .terminal_at()
                    .and_then(|at| (now - at).to_std().ok())
                    .is_some_and(|age| age >= max_age)
            })
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return Ok(expired);
        }
        expired.sort();

        // === Write-ahead: audit first ===
        self.audit.append(sweep_entry(&expired, max_age)?)?;

        for id in &expired {
            states.remove(id);
        }
        self.published.send_replace(Arc::new(states.clone()));

        info!(
            removed = expired.len(),
            remaining = states.len(),
            "Swept terminal transactions"
        );
        Ok(expired)
    }

    /// Rebuild live state from the newest state entry per transaction id
    ///
    /// Ids listed by a `RETENTION_SWEEP` entry newer than their last state
    /// entry stay swept. Replaces the current map. Replayed states are not
    /// re-audited.
    pub fn rehydrate(&self) -> Result<usize, TransitionError> {
        let latest = self
            .audit
            .latest_by_transaction(event::TRANSACTION_STATE_UPDATED)?;
        let swept = self.swept_at()?;

        let mut restored = StateSnapshot::with_capacity(latest.len());
        let mut skipped = 0usize;
        for (id, entry) in latest {
            if swept.get(&id).is_some_and(|&seq| seq > entry.sequence()) {
                skipped += 1;
                continue;
            }
            let Some(raw) = entry.metadata().get(meta::STATE) else {
                warn!(txn_id = %id, seq = entry.sequence(), "State entry has no payload, skipping");
                continue;
            };
            match serde_json::from_str::<TransactionState>(raw) {
                Ok(state) => {
                    restored.insert(id, state);
                }
                Err(e) => {
                    warn!(txn_id = %id, seq = entry.sequence(), error = %e, "Unreadable state payload, skipping");
                }
            }
        }

        let count = restored.len();
        let mut states = self
            .states
            .lock()
            .map_err(|_| TransitionError::StorePoisoned)?;
        *states = restored;
        self.published.send_replace(Arc::new(states.clone()));

        info!(restored = count, swept = skipped, "State store rehydrated from audit log");
        Ok(count)
    }

    /// Sequence of the newest sweep that removed each id
    fn swept_at(&self) -> Result<HashMap<TransactionId, u64>, AuditError> {
        let mut swept = HashMap::new();
        for entry in self
            .audit
            .scan(&AuditFilter::by_event_type(event::RETENTION_SWEEP))?
        {
            let Some(raw) = entry.metadata().get(meta::SWEPT_IDS) else {
                continue;
            };
            match serde_json::from_str::<Vec<TransactionId>>(raw) {
                Ok(ids) => {
                    for id in ids {
                        swept.insert(id, entry.sequence());
                    }
                }
                Err(e) => {
                    warn!(seq = entry.sequence(), error = %e, "Unreadable sweep entry, skipping");
                }
            }
        }
        Ok(swept)
    }

    pub fn len(&self) -> usize {
        self.published.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn audit_rejection(
        &self,
        id: &TransactionId,
        from: Option<StateTag>,
        to: StateTag,
        rejection: &TransitionError,
        metadata: Metadata,
    ) {
        let mut meta_out = Metadata::new()
            .with(meta::OLD_STATE, from.map(|t| t.as_str()).unwrap_or(meta::NO_STATE))
            .with(meta::NEW_STATE, to.as_str())
            .with(meta::ERROR_CODE, rejection.code());
        meta_out.extend(metadata);

        let entry = AuditLogEntry::new(
            event::TRANSACTION_STATE_REJECTED,
            Some(id.clone()),
            rejection.to_string(),
            meta_out,
        );
        if let Err(e) = self.audit.append(entry) {
            error!(txn_id = %id, error = %e, "Failed to audit rejected transition");
        }
    }
}

/// Legality check against the current state
fn check_edge(
    current: Option<&TransactionState>,
    proposed: &TransactionState,
) -> Result<(), TransitionError> {
    let to = proposed.tag();
    match current {
        None if to == StateTag::Initial => Ok(()),
        None => Err(TransitionError::InvalidInitialState { proposed: to }),
        Some(state) if state.is_terminal() => {
            Err(TransitionError::TerminalStateViolation { proposed: to })
        }
        Some(state) if state.can_transition_to(proposed) => Ok(()),
        Some(state) => Err(TransitionError::IllegalTransition {
            from: state.tag(),
            to,
        }),
    }
}

fn transition_entry(
    id: &TransactionId,
    from: Option<StateTag>,
    proposed: &TransactionState,
    metadata: Metadata,
) -> Result<AuditLogEntry, AuditError> {
    let encoded =
        serde_json::to_string(proposed).map_err(|e| AuditError::Serialization(e.to_string()))?;

    let mut meta_out = Metadata::new()
        .with(meta::OLD_STATE, from.map(|t| t.as_str()).unwrap_or(meta::NO_STATE))
        .with(meta::NEW_STATE, proposed.tag().as_str());
    for (k, v) in metadata.iter() {
        if k != meta::OLD_STATE && k != meta::NEW_STATE && k != meta::STATE {
            meta_out.insert(k, v);
        }
    }
    meta_out.insert(meta::STATE, encoded);

    Ok(AuditLogEntry::new(
        event::TRANSACTION_STATE_UPDATED,
        Some(id.clone()),
        format!("Transaction state updated to {}", proposed),
        meta_out,
    ))
}

fn sweep_entry(expired: &[TransactionId], max_age: Duration) -> Result<AuditLogEntry, AuditError> {
    let ids = serde_json::to_string(expired).map_err(|e| AuditError::Serialization(e.to_string()))?;
    Ok(AuditLogEntry::new(
        event::RETENTION_SWEEP,
        None,
        format!("Evicted {} terminal transactions", expired.len()),
        Metadata::new()
            .with("count", expired.len().to_string())
            .with("retention_secs", max_age.as_secs().to_string())
            .with(meta::SWEPT_IDS, ids),
    ))
}

fn status_notice(
    id: &TransactionId,
    from: Option<StateTag>,
    proposed: &TransactionState,
) -> Notification {
    let mut payload = Metadata::new()
        .with(meta::OLD_STATE, from.map(|t| t.as_str()).unwrap_or(meta::NO_STATE))
        .with(meta::NEW_STATE, proposed.tag().as_str())
        .with("summary", proposed.to_string());

    match proposed {
        TransactionState::Error { error, .. } => {
            payload.insert(meta::REASON, error.message());
            payload.insert(meta::SUGGESTED_ACTION, error.suggested_action());
        }
        TransactionState::Terminal { message, .. } => {
            payload.insert(meta::REASON, message.as_str());
        }
        _ => {}
    }

    Notification::new(id.clone(), NotificationKind::StatusChanged, payload)
}
