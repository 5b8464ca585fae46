//! Audit Log
//!
//! Append-only, integrity-checked record of every state transition and
//! recovery action.
//!
//! # Guarantees
//!
//! 1. **Single writer**: appends are serialized behind one lock, so the state
//!    store's write-ahead ordering holds.
//! 2. **Concurrent reads**: queries take a read lock on the published entries
//!    and see everything up to the last completed append.
//! 3. **Per-entry hash**: SHA-256 over sequence, timestamp, event type,
//!    transaction id, message and metadata. The sequence is sealed into the
//!    hash, so `verify` catches deleted or reordered entries even when the
//!    survivors are renumbered.

pub mod journal;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info};

use super::error::AuditError;
use super::types::{Metadata, TransactionId};

pub use journal::JournalWriter;

/// Well-known event types
pub mod event {
    pub const TRANSACTION_STATE_UPDATED: &str = "TRANSACTION_STATE_UPDATED";
    pub const TRANSACTION_STATE_REJECTED: &str = "TRANSACTION_STATE_REJECTED";
    pub const RECOVERY_ACTION_FAILED: &str = "RECOVERY_ACTION_FAILED";
    pub const MANUAL_INTERVENTION_REQUIRED: &str = "MANUAL_INTERVENTION_REQUIRED";
    pub const RETENTION_SWEEP: &str = "RETENTION_SWEEP";
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    sequence: u64,
    timestamp: DateTime<Utc>,
    event_type: String,
    transaction_id: Option<TransactionId>,
    message: String,
    metadata: Metadata,
    hash: String,
}

impl AuditLogEntry {
    pub fn new(
        event_type: impl Into<String>,
        transaction_id: Option<TransactionId>,
        message: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let mut entry = Self {
            sequence: 0,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            transaction_id,
            message: message.into(),
            metadata,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// Assign the log position and stamp the integrity hash
    pub(crate) fn seal(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.hash = self.compute_hash();
    }

    /// SHA-256 over the entry's own fields, each length-prefixed
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };

        field(&self.sequence.to_le_bytes());
        field(
            self.timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        field(self.event_type.as_bytes());
        field(
            self.transaction_id
                .as_ref()
                .map(|id| id.as_str())
                .unwrap_or("")
                .as_bytes(),
        );
        field(self.message.as_bytes());
        for (k, v) in self.metadata.iter() {
            field(k.as_bytes());
            field(v.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Recompute the hash and compare with the stored one
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        let actual = self.compute_hash();
        if actual != self.hash {
            return Err(AuditError::IntegrityViolation {
                sequence: self.sequence,
                expected: self.hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction_id.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Where sealed entries go before they become visible
pub trait AuditBackend: Send {
    fn persist(&mut self, entry: &AuditLogEntry) -> Result<(), AuditError>;
}

/// Memory-only backend; entries live as long as the process
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl AuditBackend for MemoryBackend {
    fn persist(&mut self, _entry: &AuditLogEntry) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Query filter; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<String>,
    pub transaction_id: Option<TransactionId>,
}

impl AuditFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_transaction(id: impl Into<TransactionId>) -> Self {
        Self {
            event_type: None,
            transaction_id: Some(id.into()),
        }
    }

    pub fn by_event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            transaction_id: None,
        }
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(ref event_type) = self.event_type
            && entry.event_type != *event_type
        {
            return false;
        }
        if let Some(ref id) = self.transaction_id
            && entry.transaction_id.as_ref() != Some(id)
        {
            return false;
        }
        true
    }
}

/// Continuation point for newest-first paging
///
/// Holds the sequence of the last returned entry, so paging is stable while
/// new entries keep arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditCursor {
    before: u64,
}

/// One page of query results, newest first
#[derive(Debug, Clone)]
pub struct AuditPage {
    pub entries: Vec<Arc<AuditLogEntry>>,
    pub next_cursor: Option<AuditCursor>,
}

struct AuditWriter {
    backend: Box<dyn AuditBackend>,
    next_seq: u64,
}

pub struct AuditLog {
    writer: Mutex<AuditWriter>,
    entries: RwLock<Vec<Arc<AuditLogEntry>>>,
}

impl AuditLog {
    /// Memory-only log
    pub fn in_memory() -> Self {
        Self::with_backend(Box::new(MemoryBackend))
    }

    pub fn with_backend(backend: Box<dyn AuditBackend>) -> Self {
        Self {
            writer: Mutex::new(AuditWriter {
                backend,
                next_seq: 0,
            }),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Open a journal-backed log, replaying existing records
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let replayed = journal::recover(path)?;
        let next_seq = replayed.last().map(|e| e.sequence + 1).unwrap_or(0);
        let writer = JournalWriter::open(path)?;

        info!(
            path = %path.display(),
            entries = replayed.len(),
            "Audit journal opened"
        );

        Ok(Self {
            writer: Mutex::new(AuditWriter {
                backend: Box::new(writer),
                next_seq,
            }),
            entries: RwLock::new(replayed.into_iter().map(Arc::new).collect()),
        })
    }

    /// Append an entry; returns its assigned sequence
    ///
    /// The entry is persisted before it becomes visible to `query`.
    pub fn append(&self, mut entry: AuditLogEntry) -> Result<u64, AuditError> {
        let mut writer = self.writer.lock().map_err(|_| AuditError::WriterPoisoned)?;

        let seq = writer.next_seq;
        entry.seal(seq);

        if let Err(e) = writer.backend.persist(&entry) {
            error!(
                seq,
                event_type = %entry.event_type,
                error = %e,
                "Audit append failed"
            );
            return Err(e);
        }

        self.entries
            .write()
            .map_err(|_| AuditError::WriterPoisoned)?
            .push(Arc::new(entry));
        writer.next_seq += 1;

        Ok(seq)
    }

    /// Newest-first query, at most `limit` entries
    pub fn query(
        &self,
        filter: &AuditFilter,
        limit: usize,
        cursor: Option<AuditCursor>,
    ) -> Result<AuditPage, AuditError> {
        let entries = self.entries.read().map_err(|_| AuditError::WriterPoisoned)?;
        let before = cursor.map(|c| c.before).unwrap_or(u64::MAX);

        let mut matched = entries
            .iter()
            .rev()
            .filter(|e| e.sequence < before && filter.matches(e));

        let page: Vec<Arc<AuditLogEntry>> = matched.by_ref().take(limit).cloned().collect();
        let has_more = matched.next().is_some();
        let next_cursor = match page.last() {
            Some(last) if has_more => Some(AuditCursor {
                before: last.sequence,
            }),
            _ => None,
        };

        Ok(AuditPage {
            entries: page,
            next_cursor,
        })
    }

    /// Recompute every hash and check sequences are contiguous from zero
    ///
    /// Returns the number of verified entries.
    pub fn verify(&self) -> Result<usize, AuditError> {
        let entries = self.entries.read().map_err(|_| AuditError::WriterPoisoned)?;
        for (expected, entry) in entries.iter().enumerate() {
            let expected = expected as u64;
            if entry.sequence != expected {
                error!(expected, found = entry.sequence, "Audit sequence gap");
                return Err(AuditError::SequenceGap {
                    expected,
                    found: entry.sequence,
                });
            }
            if let Err(e) = entry.verify_integrity() {
                error!(seq = entry.sequence, error = %e, "Audit entry corrupted");
                return Err(e);
            }
        }
        Ok(entries.len())
    }

    /// Every matching entry, oldest first
    pub fn scan(&self, filter: &AuditFilter) -> Result<Vec<Arc<AuditLogEntry>>, AuditError> {
        let entries = self.entries.read().map_err(|_| AuditError::WriterPoisoned)?;
        Ok(entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    /// Newest entry of `event_type` for each transaction id
    pub fn latest_by_transaction(
        &self,
        event_type: &str,
    ) -> Result<HashMap<TransactionId, Arc<AuditLogEntry>>, AuditError> {
        let entries = self.entries.read().map_err(|_| AuditError::WriterPoisoned)?;
        let mut latest = HashMap::new();
        for entry in entries.iter().filter(|e| e.event_type == event_type) {
            if let Some(ref id) = entry.transaction_id {
                latest.insert(id.clone(), entry.clone());
            }
        }
        Ok(latest)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
