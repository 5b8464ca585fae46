//! Audit Journal
//!
//! Append-only binary file backing the audit log. One record per entry:
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ payload_len│ 4 bytes   │ bincode payload size               │
//! │ seq_id     │ 8 bytes   │ Audit sequence number              │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```
//!
//! The CRC guards the frame (torn writes, bit rot). The entry's own SHA-256
//! hash guards its content and is checked separately by `AuditLog::verify`.

use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use super::{AuditBackend, AuditLogEntry};
use crate::recovery::error::AuditError;

/// Journal record header size in bytes
pub const JOURNAL_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub payload_len: u32,
    pub seq_id: u64,
    pub checksum: u32,
}

impl JournalHeader {
    pub fn new(seq_id: u64, payload: &[u8]) -> Self {
        Self {
            payload_len: payload.len() as u32,
            seq_id,
            checksum: crc32_checksum(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[4..12].copy_from_slice(&self.seq_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; JOURNAL_HEADER_SIZE]) -> Self {
        Self {
            payload_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            seq_id: u64::from_le_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            checksum: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Byte sink under a journal writer
///
/// `truncate` must cut the sink back to exactly `len` bytes so a failed
/// append leaves no partial record behind.
pub trait JournalSink: Write + Send {
    fn byte_len(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl JournalSink for File {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Durable journal writer
///
/// Each record goes out as one write followed by a sync. If either fails the
/// file is cut back to the last complete record. If that cut also fails the
/// writer refuses all further appends.
pub struct JournalWriter<S: JournalSink = File> {
    sink: S,
    path: PathBuf,
    /// End of the last complete record
    good_len: u64,
    failed: bool,
}

impl JournalWriter<File> {
    /// Open for append, creating the file if needed
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Self::with_sink(file, path)
    }
}

impl<S: JournalSink> JournalWriter<S> {
    pub fn with_sink(sink: S, path: impl Into<PathBuf>) -> io::Result<Self> {
        let good_len = sink.byte_len()?;
        Ok(Self {
            sink,
            path: path.into(),
            good_len,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        self.sink.write_all(record)?;
        self.sink.flush()?;
        self.sink.sync()
    }
}

impl<S: JournalSink> AuditBackend for JournalWriter<S> {
    fn persist(&mut self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        if self.failed {
            return Err(AuditError::Io(io::Error::other(
                "audit journal writer failed, reopen to recover",
            )));
        }

        let payload = bincode::serialize(entry)?;
        let header = JournalHeader::new(entry.sequence(), &payload);
        let mut record = Vec::with_capacity(JOURNAL_HEADER_SIZE + payload.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(&payload);

        if let Err(e) = self.write_record(&record) {
            warn!(
                path = %self.path.display(),
                seq_id = entry.sequence(),
                good_len = self.good_len,
                error = %e,
                "Audit journal append failed, rolling back"
            );
            if let Err(te) = self.sink.truncate(self.good_len) {
                error!(
                    path = %self.path.display(),
                    error = %te,
                    "Audit journal rollback failed, writer disabled"
                );
                self.failed = true;
            }
            return Err(e.into());
        }

        self.good_len += record.len() as u64;
        Ok(())
    }
}

/// Journal reader used on open/replay
pub struct JournalReader<R: Read> {
    reader: R,
    /// Bytes belonging to complete, checksummed records
    valid_len: u64,
}

impl JournalReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> JournalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            valid_len: 0,
        }
    }

    /// Read the next entry, returns None at EOF or at a torn trailing record
    pub fn read_entry(&mut self) -> Result<Option<AuditLogEntry>, AuditError> {
        let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
        let read = read_fully(&mut self.reader, &mut header_buf)?;
        if read == 0 {
            return Ok(None);
        }
        if read < JOURNAL_HEADER_SIZE {
            warn!(
                offset = self.valid_len,
                bytes = read,
                "Torn audit journal header at tail, ignoring"
            );
            return Ok(None);
        }

        let header = JournalHeader::from_bytes(&header_buf);
        let mut payload = vec![0u8; header.payload_len as usize];
        let read = read_fully(&mut self.reader, &mut payload)?;
        if read < payload.len() {
            warn!(
                offset = self.valid_len,
                seq_id = header.seq_id,
                "Torn audit journal record at tail, ignoring"
            );
            return Ok(None);
        }

        if !header.verify_checksum(&payload) {
            return Err(AuditError::IntegrityViolation {
                sequence: header.seq_id,
                expected: format!("crc32:{:08x}", header.checksum),
                actual: format!("crc32:{:08x}", crc32_checksum(&payload)),
            });
        }

        let entry: AuditLogEntry = bincode::deserialize(&payload)?;
        if entry.sequence() != header.seq_id {
            return Err(AuditError::SequenceGap {
                expected: header.seq_id,
                found: entry.sequence(),
            });
        }

        self.valid_len += (JOURNAL_HEADER_SIZE + payload.len()) as u64;
        debug!(seq_id = header.seq_id, "Replayed audit record");
        Ok(Some(entry))
    }

    /// Read all complete records
    pub fn read_all(&mut self) -> Result<Vec<AuditLogEntry>, AuditError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.read_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Replay an existing journal and drop any torn tail so appends stay aligned
pub fn recover(path: impl AsRef<Path>) -> Result<Vec<AuditLogEntry>, AuditError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = JournalReader::open(path)?;
    let entries = reader.read_all()?;
    let valid_len = reader.valid_len();

    let file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() > valid_len {
        warn!(
            path = %path.display(),
            valid_len,
            "Truncating torn audit journal tail"
        );
        file.set_len(valid_len)?;
        file.sync_data()?;
    }

    Ok(entries)
}
