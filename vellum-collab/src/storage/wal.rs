//! Write-ahead log for crash-safe persistence of confirmed operations.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              WriteAheadLog                    │
//! │                                              │
//! │  Buffer: [ entry | entry | entry | ... ]     │
//! │                                              │
//! │  Flush when:                                 │
//! │    1. Buffer exceeds the byte threshold      │
//! │    2. Entry count exceeds the limit          │
//! │    3. Explicit flush()                       │
//! │                                              │
//! │  Recovery: checksum-verify, sort, replay     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Entries buffer in memory for fast append; the persist worker writes
//! flushed batches to the store's WAL column family and truncates them once
//! a snapshot makes them redundant. Each entry carries the document version
//! its operation produced, so recovery can tell exactly which operations a
//! snapshot already covers.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Write-Ahead Logs)

use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// WAL entry type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// A confirmed, applied operation
    Op = 1,
    /// A full materialized snapshot
    Snapshot = 2,
    /// Checkpoint marker (all prior entries are durable elsewhere)
    Checkpoint = 3,
}

/// A single WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number
    pub sequence: u64,
    /// Entry type
    pub entry_type: WalEntryType,
    /// Document this entry belongs to
    pub document_id: Uuid,
    /// Document version the payload corresponds to (0 for checkpoints)
    pub version: u64,
    /// Payload (encoded confirmed op or snapshot bytes)
    pub payload: Vec<u8>,
    /// FNV-fold checksum for integrity verification
    pub checksum: u32,
}

impl WalEntry {
    /// Create a new WAL entry with computed checksum.
    pub fn new(
        sequence: u64,
        entry_type: WalEntryType,
        document_id: Uuid,
        version: u64,
        payload: Vec<u8>,
    ) -> Self {
        let checksum =
            Self::compute_checksum(sequence, entry_type, &document_id, version, &payload);
        Self {
            sequence,
            entry_type,
            document_id,
            version,
            payload,
            checksum,
        }
    }

    /// Verify the entry's checksum.
    pub fn verify(&self) -> bool {
        let expected = Self::compute_checksum(
            self.sequence,
            self.entry_type,
            &self.document_id,
            self.version,
            &self.payload,
        );
        self.checksum == expected
    }

    /// FNV-fold over all entry fields.
    fn compute_checksum(
        sequence: u64,
        entry_type: WalEntryType,
        document_id: &Uuid,
        version: u64,
        payload: &[u8],
    ) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        let mut mix = |word: u32| {
            hash ^= word;
            hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        };
        mix(sequence as u32);
        mix((sequence >> 32) as u32);
        mix(entry_type as u32);
        mix(version as u32);
        mix((version >> 32) as u32);
        for byte in document_id.as_bytes() {
            mix(*byte as u32);
        }
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            mix(u32::from_le_bytes(word));
        }
        hash
    }

    /// Serialize entry to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WalError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| WalError::SerializationError(e.to_string()))
    }

    /// Deserialize entry from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WalError> {
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| WalError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }

    /// Approximate serialized size in bytes.
    pub fn encoded_size(&self) -> usize {
        8 + 1 + 16 + 8 + 4 + self.payload.len() + 8 // fixed fields + bincode overhead
    }
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Buffer size before auto-flush (bytes). Default: 64KB.
    pub flush_threshold: usize,
    /// Maximum entries before auto-flush. Default: 1000.
    pub max_buffered_entries: usize,
    /// Sync interval hint (caller runs the periodic sync). Default: 1s.
    pub sync_interval_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 64 * 1024,
            max_buffered_entries: 1000,
            sync_interval_ms: 1000,
        }
    }
}

impl WalConfig {
    /// Config for testing (small buffers, immediate flush).
    pub fn for_testing() -> Self {
        Self {
            flush_threshold: 1024,
            max_buffered_entries: 10,
            sync_interval_ms: 100,
        }
    }
}

/// WAL errors.
#[derive(Debug, Clone)]
pub enum WalError {
    SerializationError(String),
    DeserializationError(String),
    ChecksumMismatch { sequence: u64 },
    Closed,
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalError::SerializationError(e) => write!(f, "WAL serialization error: {e}"),
            WalError::DeserializationError(e) => write!(f, "WAL deserialization error: {e}"),
            WalError::ChecksumMismatch { sequence } => {
                write!(f, "WAL checksum mismatch at sequence {sequence}")
            }
            WalError::Closed => write!(f, "WAL is closed"),
        }
    }
}

impl std::error::Error for WalError {}

/// In-memory write-ahead log with batched flushing.
///
/// The flushed entries are returned to the caller for persistence (written
/// to the store's WAL column family by the persist worker).
pub struct WriteAheadLog {
    config: WalConfig,
    buffer: Vec<WalEntry>,
    buffer_bytes: usize,
    next_sequence: u64,
    total_appended: u64,
    total_flushed: u64,
    last_flush: Instant,
    open: bool,
}

impl WriteAheadLog {
    pub fn new(config: WalConfig) -> Self {
        Self {
            buffer: Vec::with_capacity(config.max_buffered_entries),
            buffer_bytes: 0,
            next_sequence: 0,
            total_appended: 0,
            total_flushed: 0,
            last_flush: Instant::now(),
            open: true,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(WalConfig::default())
    }

    /// Create starting from a given sequence number (after recovery).
    pub fn from_sequence(config: WalConfig, start_sequence: u64) -> Self {
        let mut wal = Self::new(config);
        wal.next_sequence = start_sequence;
        wal
    }

    /// Append a confirmed-operation entry.
    ///
    /// Returns the sequence number assigned and whether a flush is due.
    pub fn append_op(
        &mut self,
        document_id: Uuid,
        version: u64,
        payload: Vec<u8>,
    ) -> Result<(u64, bool), WalError> {
        self.append_entry(WalEntryType::Op, document_id, version, payload)
    }

    /// Append a snapshot entry.
    pub fn append_snapshot(
        &mut self,
        document_id: Uuid,
        version: u64,
        payload: Vec<u8>,
    ) -> Result<(u64, bool), WalError> {
        self.append_entry(WalEntryType::Snapshot, document_id, version, payload)
    }

    /// Append a checkpoint marker.
    pub fn append_checkpoint(&mut self, document_id: Uuid) -> Result<(u64, bool), WalError> {
        self.append_entry(WalEntryType::Checkpoint, document_id, 0, Vec::new())
    }

    fn append_entry(
        &mut self,
        entry_type: WalEntryType,
        document_id: Uuid,
        version: u64,
        payload: Vec<u8>,
    ) -> Result<(u64, bool), WalError> {
        if !self.open {
            return Err(WalError::Closed);
        }

        let seq = self.next_sequence;
        self.next_sequence += 1;

        let entry = WalEntry::new(seq, entry_type, document_id, version, payload);
        self.buffer_bytes += entry.encoded_size();
        self.buffer.push(entry);
        self.total_appended += 1;

        Ok((seq, self.should_flush()))
    }

    fn should_flush(&self) -> bool {
        self.buffer_bytes >= self.config.flush_threshold
            || self.buffer.len() >= self.config.max_buffered_entries
    }

    /// Flush all buffered entries, returning them for persistence.
    pub fn flush(&mut self) -> Vec<WalEntry> {
        if self.buffer.is_empty() {
            return Vec::new();
        }

        let entries = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;
        self.total_flushed += entries.len() as u64;
        self.last_flush = Instant::now();
        self.buffer = Vec::with_capacity(self.config.max_buffered_entries);
        entries
    }

    pub fn needs_flush(&self) -> bool {
        self.should_flush()
    }

    /// Whether a periodic sync is due.
    pub fn needs_sync(&self) -> bool {
        self.last_flush.elapsed().as_millis() as u64 >= self.config.sync_interval_ms
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn total_flushed(&self) -> u64 {
        self.total_flushed
    }

    /// Close the WAL and return any remaining buffered entries.
    pub fn close(&mut self) -> Vec<WalEntry> {
        self.open = false;
        self.flush()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Recover entries from serialized bytes.
    ///
    /// Verifies checksums, skips corrupted entries, returns entries sorted
    /// by sequence along with the number of corrupted entries skipped.
    pub fn recover_entries(serialized: &[Vec<u8>]) -> (Vec<WalEntry>, usize) {
        let mut valid = Vec::with_capacity(serialized.len());
        let mut corrupted = 0;

        for bytes in serialized {
            match WalEntry::decode(bytes) {
                Ok(entry) if entry.verify() => valid.push(entry),
                _ => corrupted += 1,
            }
        }

        valid.sort_by_key(|e| e.sequence);
        (valid, corrupted)
    }
}
