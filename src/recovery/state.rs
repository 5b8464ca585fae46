//! Transaction State Definitions
//!
//! The lifecycle of a ledger transaction as a closed tagged union, plus the
//! transition table that decides which edges are legal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::TransactionError;

/// Confirmation polling stage while in `Verifying`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationStage {
    /// Waiting for the ledger to include and confirm the transaction
    BlockchainState,
    /// Waiting for contract-level execution checks
    SmartContract,
}

impl VerificationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStage::BlockchainState => "BLOCKCHAIN_STATE",
            VerificationStage::SmartContract => "SMART_CONTRACT",
        }
    }
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalOutcome {
    Success,
    Failure,
    RolledBack,
}

impl TerminalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalOutcome::Success => "SUCCESS",
            TerminalOutcome::Failure => "FAILURE",
            TerminalOutcome::RolledBack => "ROLLED_BACK",
        }
    }
}

/// Transaction FSM States
///
/// Exactly one value is active per transaction id. `Terminal` is absorbing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Registered, nothing sent to the ledger yet
    Initial,

    /// Ledger submission in flight
    Processing { progress: u8, message: String },

    /// Confirmation polling
    Verifying {
        stage: VerificationStage,
        progress: u8,
    },

    /// Ledger accepted the transaction
    Confirmed,

    /// A step failed
    Error {
        error: TransactionError,
        recoverable: bool,
    },

    /// Compensating action requested
    RollbackInitiated,

    /// Compensating action acknowledged by the ledger
    RollbackInProgress,

    /// Final. No further transitions permitted.
    Terminal {
        outcome: TerminalOutcome,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Payload-free discriminant of [`TransactionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateTag {
    Initial,
    Processing,
    Verifying,
    Confirmed,
    Error,
    RollbackInitiated,
    RollbackInProgress,
    Terminal,
}

impl StateTag {
    pub const ALL: [StateTag; 8] = [
        StateTag::Initial,
        StateTag::Processing,
        StateTag::Verifying,
        StateTag::Confirmed,
        StateTag::Error,
        StateTag::RollbackInitiated,
        StateTag::RollbackInProgress,
        StateTag::Terminal,
    ];

    /// Legality graph. Any edge not listed here is illegal.
    ///
    /// ```text
    /// INITIAL              -> PROCESSING | ERROR
    /// PROCESSING           -> VERIFYING  | ERROR
    /// VERIFYING            -> CONFIRMED  | ERROR
    /// ERROR                -> PROCESSING | ROLLBACK_INITIATED | TERMINAL
    /// ROLLBACK_INITIATED   -> ROLLBACK_IN_PROGRESS | TERMINAL
    /// ROLLBACK_IN_PROGRESS -> TERMINAL
    /// CONFIRMED            -> TERMINAL
    /// TERMINAL             -> (none)
    /// ```
    pub fn can_transition_to(self, next: StateTag) -> bool {
        use StateTag::*;
        matches!(
            (self, next),
            (Initial, Processing)
                | (Initial, Error)
                | (Processing, Verifying)
                | (Processing, Error)
                | (Verifying, Confirmed)
                | (Verifying, Error)
                | (Error, Processing)
                | (Error, RollbackInitiated)
                | (Error, Terminal)
                | (RollbackInitiated, RollbackInProgress)
                | (RollbackInitiated, Terminal)
                | (RollbackInProgress, Terminal)
                | (Confirmed, Terminal)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateTag::Initial => "INITIAL",
            StateTag::Processing => "PROCESSING",
            StateTag::Verifying => "VERIFYING",
            StateTag::Confirmed => "CONFIRMED",
            StateTag::Error => "ERROR",
            StateTag::RollbackInitiated => "ROLLBACK_INITIATED",
            StateTag::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            StateTag::Terminal => "TERMINAL",
        }
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TransactionState {
    pub fn tag(&self) -> StateTag {
        match self {
            TransactionState::Initial => StateTag::Initial,
            TransactionState::Processing { .. } => StateTag::Processing,
            TransactionState::Verifying { .. } => StateTag::Verifying,
            TransactionState::Confirmed => StateTag::Confirmed,
            TransactionState::Error { .. } => StateTag::Error,
            TransactionState::RollbackInitiated => StateTag::RollbackInitiated,
            TransactionState::RollbackInProgress => StateTag::RollbackInProgress,
            TransactionState::Terminal { .. } => StateTag::Terminal,
        }
    }

    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Terminal { .. })
    }

    #[inline]
    pub fn can_transition_to(&self, next: &TransactionState) -> bool {
        self.tag().can_transition_to(next.tag())
    }

    /// Build an `Error` state with recoverability taken from the taxonomy
    pub fn error(error: TransactionError) -> Self {
        let recoverable = error.is_recoverable();
        TransactionState::Error { error, recoverable }
    }

    /// Build a `Terminal` state stamped with the current time
    pub fn terminal(outcome: TerminalOutcome, message: impl Into<String>) -> Self {
        TransactionState::Terminal {
            outcome,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// When a terminal state was reached
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TransactionState::Terminal { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Processing { progress, message } => {
                write!(f, "PROCESSING({}%: {})", progress, message)
            }
            TransactionState::Verifying { stage, progress } => {
                write!(f, "VERIFYING({} {}%)", stage.as_str(), progress)
            }
            TransactionState::Error { error, recoverable } => {
                write!(f, "ERROR({}, recoverable={})", error.code(), recoverable)
            }
            TransactionState::Terminal {
                outcome, message, ..
            } => write!(f, "TERMINAL({}: {})", outcome.as_str(), message),
            other => write!(f, "{}", other.tag()),
        }
    }
}
