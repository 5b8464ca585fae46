//! txn_recovery - Blockchain Payment Transaction Recovery
//!
//! Tracks payment transactions through a strict state machine, drives
//! recovery against an external ledger and keeps a tamper-evident audit
//! trail of every change.
//!
//! # Modules
//!
//! - [`recovery`] - State store, orchestrator, audit log, ledger gateway
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod logging;
pub mod recovery;

// Convenient re-exports at crate root
pub use recovery::{
    AuditLog, AuditLogEntry, LedgerGateway, RecoveryError, RecoveryOrchestrator, RecoveryRequest,
    TransactionError, TransactionId, TransactionState, TransactionStateStore, TransitionError,
};
