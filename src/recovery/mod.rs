//! Payment Transaction Recovery
//!
//! Tracks blockchain payment transactions through a fixed lifecycle and
//! drives recovery actions (retry, verify, validate, rollback, finalize)
//! against an external ledger. Every accepted transition is written to a
//! tamper-evident audit log before it becomes visible.
//!
//! # State Machine
//!
//! ```text
//! INITIAL → PROCESSING → VERIFYING → CONFIRMED → TERMINAL
//!    ↓          ↓  ↑         ↓                      ↑
//!    └────────→ ERROR ←──────┘                      │
//!                 ↓ └───────────────────────────────┤
//!          ROLLBACK_INITIATED → ROLLBACK_IN_PROGRESS┘
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Audit-Before-Visible**: a transition is readable only after its audit entry is durable
//! 2. **Terminal Is Final**: nothing leaves `TERMINAL`
//! 3. **Single Total Order**: all transitions, across all ids, are serialized
//! 4. **Typed Failures**: ledger failures reach the core only as `TransactionError`

pub mod audit;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use audit::{AuditCursor, AuditFilter, AuditLog, AuditLogEntry, AuditPage};
pub use error::{AuditError, RecoveryError, TransactionError, TransitionError};
pub use gateway::{LedgerGateway, RpcLedgerGateway};
pub use notify::{
    LoggingSink, Notification, NotificationDispatcher, NotificationKind, NotificationReceiver,
    NotificationSender, NotificationSink, notification_channel,
};
pub use orchestrator::RecoveryOrchestrator;
pub use state::{StateTag, TerminalOutcome, TransactionState, VerificationStage};
pub use store::{StateSnapshot, TransactionStateStore};
pub use types::{
    LedgerReceipt, LedgerTransaction, Metadata, Operation, OperationResult, RecoveryRequest,
    TransactionId, ValidationReport, VerificationReport,
};
pub use worker::{RetentionConfig, RetentionWorker};
