//! Recovery Core Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::{TransactionState, VerificationStage};

/// Opaque transaction identifier
///
/// Callers bring their own ids (wallet tx references, client keys). For
/// callers without one, [`TransactionId::generate`] mints a ULID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique TransactionId
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered key/value pairs attached to audit entries
///
/// Insertion order is preserved; it is part of the integrity hash input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Replace the value for an existing key or append a new pair
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append all pairs from `other`, overriding duplicates
    pub fn extend(&mut self, other: Metadata) {
        for (k, v) in other.0 {
            self.insert(k, v);
        }
    }
}

/// Input to every recovery operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub transaction_id: TransactionId,
    pub wallet_address: String,
    pub recovery_attempt_count: u32,
}

impl RecoveryRequest {
    pub fn new(transaction_id: impl Into<TransactionId>, wallet_address: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            wallet_address: wallet_address.into(),
            recovery_attempt_count: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.recovery_attempt_count = attempts;
        self
    }
}

/// Recovery operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Submit,
    Retry,
    Verify,
    Rollback,
    Validate,
    Finalize,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Submit => "SUBMIT",
            Operation::Retry => "RETRY",
            Operation::Verify => "VERIFY",
            Operation::Rollback => "ROLLBACK",
            Operation::Validate => "VALIDATE",
            Operation::Finalize => "FINALIZE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger acknowledgement of a submit/retry/rollback/finalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub tx_hash: String,
    #[serde(default)]
    pub message: String,
}

/// Ledger confirmation report returned by `verify`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub stage: VerificationStage,
    pub progress: u8,
}

/// Ledger contract-level validation verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Transaction as the ledger sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub tx_hash: String,
    pub status: String,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// Successful outcome of one orchestrator operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub transaction_id: TransactionId,
    pub operation: Operation,
    /// State after the operation's transitions were committed
    pub state: TransactionState,
    pub tx_hash: Option<String>,
    pub recovery_attempt_count: u32,
    pub completed_at: DateTime<Utc>,
}
