//! Recovery Error Types
//!
//! `TransactionError` is the taxonomy every ledger failure is normalized into.
//! The other enums cover the store, the audit log and the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::StateTag;

/// Ledger failure taxonomy
///
/// Every failure at the gateway boundary becomes exactly one of these.
/// `cause` is a rendering of the underlying library error, if any.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionError {
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        cause: Option<String>,
    },

    #[error("Insufficient funds: {message}")]
    InsufficientFunds {
        message: String,
        cause: Option<String>,
    },

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        cause: Option<String>,
    },

    #[error("Timed out: {message}")]
    Timeout {
        message: String,
        cause: Option<String>,
    },

    #[error("Blockchain error: {message}")]
    BlockchainError {
        message: String,
        cause: Option<String>,
    },

    #[error("Wallet error: {message}")]
    WalletError {
        message: String,
        cause: Option<String>,
    },

    #[error("Unknown error: {message}")]
    Unknown {
        message: String,
        cause: Option<String>,
    },
}

impl TransactionError {
    pub fn network(message: impl Into<String>) -> Self {
        TransactionError::NetworkError {
            message: message.into(),
            cause: None,
        }
    }

    pub fn insufficient_funds(message: impl Into<String>) -> Self {
        TransactionError::InsufficientFunds {
            message: message.into(),
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        TransactionError::Validation {
            message: message.into(),
            cause: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        TransactionError::Timeout {
            message: message.into(),
            cause: None,
        }
    }

    pub fn blockchain(message: impl Into<String>) -> Self {
        TransactionError::BlockchainError {
            message: message.into(),
            cause: None,
        }
    }

    pub fn wallet(message: impl Into<String>) -> Self {
        TransactionError::WalletError {
            message: message.into(),
            cause: None,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        TransactionError::Unknown {
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying error
    pub fn with_cause(mut self, source: impl std::fmt::Display) -> Self {
        let rendered = Some(source.to_string());
        match &mut self {
            TransactionError::NetworkError { cause, .. }
            | TransactionError::InsufficientFunds { cause, .. }
            | TransactionError::Validation { cause, .. }
            | TransactionError::Timeout { cause, .. }
            | TransactionError::BlockchainError { cause, .. }
            | TransactionError::WalletError { cause, .. }
            | TransactionError::Unknown { cause, .. } => *cause = rendered,
        }
        self
    }

    pub fn message(&self) -> &str {
        match self {
            TransactionError::NetworkError { message, .. }
            | TransactionError::InsufficientFunds { message, .. }
            | TransactionError::Validation { message, .. }
            | TransactionError::Timeout { message, .. }
            | TransactionError::BlockchainError { message, .. }
            | TransactionError::WalletError { message, .. }
            | TransactionError::Unknown { message, .. } => message,
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            TransactionError::NetworkError { cause, .. }
            | TransactionError::InsufficientFunds { cause, .. }
            | TransactionError::Validation { cause, .. }
            | TransactionError::Timeout { cause, .. }
            | TransactionError::BlockchainError { cause, .. }
            | TransactionError::WalletError { cause, .. }
            | TransactionError::Unknown { cause, .. } => cause.as_deref(),
        }
    }

    /// Get the error code for audit metadata and API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransactionError::NetworkError { .. } => "NETWORK_ERROR",
            TransactionError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransactionError::Validation { .. } => "VALIDATION",
            TransactionError::Timeout { .. } => "TIMEOUT",
            TransactionError::BlockchainError { .. } => "BLOCKCHAIN_ERROR",
            TransactionError::WalletError { .. } => "WALLET_ERROR",
            TransactionError::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Transient classes may be retried without a rollback
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransactionError::NetworkError { .. } | TransactionError::Timeout { .. }
        )
    }

    /// Next step to show the end user
    pub fn suggested_action(&self) -> &'static str {
        match self {
            TransactionError::NetworkError { .. } => "Check connectivity and retry the transaction",
            TransactionError::Timeout { .. } => "Retry the transaction once the network settles",
            TransactionError::InsufficientFunds { .. } => {
                "Top up the wallet, then roll back and resubmit"
            }
            TransactionError::Validation { .. } => "Correct the transaction details and roll back",
            TransactionError::BlockchainError { .. } => {
                "Roll back the transaction and contact support if it persists"
            }
            TransactionError::WalletError { .. } => "Reconnect the wallet and roll back",
            TransactionError::Unknown { .. } => "Contact support for manual review",
        }
    }
}

/// Audit log failures
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit entry serialization failed: {0}")]
    Serialization(String),

    #[error("Integrity hash mismatch at sequence {sequence}: expected {expected}, got {actual}")]
    IntegrityViolation {
        sequence: u64,
        expected: String,
        actual: String,
    },

    #[error("Audit sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Audit writer lock poisoned")]
    WriterPoisoned,
}

impl AuditError {
    pub fn code(&self) -> &'static str {
        match self {
            AuditError::Io(_) => "AUDIT_IO",
            AuditError::Serialization(_) => "AUDIT_SERIALIZATION",
            AuditError::IntegrityViolation { .. } => "AUDIT_INTEGRITY_VIOLATION",
            AuditError::SequenceGap { .. } => "AUDIT_SEQUENCE_GAP",
            AuditError::WriterPoisoned => "AUDIT_WRITER_POISONED",
        }
    }

    /// Corruption is not recoverable; I/O might be
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            AuditError::IntegrityViolation { .. } | AuditError::SequenceGap { .. }
        )
    }
}

impl From<bincode::Error> for AuditError {
    fn from(e: bincode::Error) -> Self {
        AuditError::Serialization(e.to_string())
    }
}

/// State store rejections
#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("No current state and proposed state {proposed} is not INITIAL")]
    InvalidInitialState { proposed: StateTag },

    #[error("Transaction is terminal; {proposed} rejected")]
    TerminalStateViolation { proposed: StateTag },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: StateTag, to: StateTag },

    #[error("Transition aborted, audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error("State store lock poisoned")]
    StorePoisoned,
}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::InvalidInitialState { .. } => "INVALID_INITIAL_STATE",
            TransitionError::TerminalStateViolation { .. } => "TERMINAL_STATE_VIOLATION",
            TransitionError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            TransitionError::Audit(_) => "AUDIT_FAILURE",
            TransitionError::StorePoisoned => "STORE_POISONED",
        }
    }
}

/// Orchestrator failures
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// Typed gateway failure; already audited and reflected in state
    #[error(transparent)]
    Ledger(#[from] TransactionError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Transaction not registered: {0}")]
    NotRegistered(String),

    #[error("Transaction already registered: {0}")]
    AlreadyRegistered(String),

    #[error("{operation} not allowed in state {state}")]
    OperationNotAllowed {
        operation: &'static str,
        state: StateTag,
    },

    /// Another operation on the same id has not finished yet
    #[error("{operation} rejected, another operation is in flight for {id}")]
    InFlight { operation: &'static str, id: String },
}

impl RecoveryError {
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryError::Ledger(e) => e.code(),
            RecoveryError::Transition(e) => e.code(),
            RecoveryError::NotRegistered(_) => "NOT_REGISTERED",
            RecoveryError::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            RecoveryError::OperationNotAllowed { .. } => "OPERATION_NOT_ALLOWED",
            RecoveryError::InFlight { .. } => "OPERATION_IN_FLIGHT",
        }
    }

    /// The ledger error, if this failure came from the gateway
    pub fn ledger_error(&self) -> Option<&TransactionError> {
        match self {
            RecoveryError::Ledger(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AuditError> for RecoveryError {
    fn from(e: AuditError) -> Self {
        RecoveryError::Transition(TransitionError::Audit(e))
    }
}
