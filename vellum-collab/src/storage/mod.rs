//! Persistent storage layer for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  confirmed ops  ┌──────────────┐
//! │ Coordinator  │ ──────────────► │ persist      │
//! │ (in-memory)  │   (per doc)     │ worker       │
//! └──────┬───────┘                 └──────┬───────┘
//!        │ on startup                     │
//!        ▼                                ▼
//! ┌──────────────┐     ┌──────────────────────────────────┐
//! │ Document     │     │ DocumentStore (RocksDB)           │
//! │ (restored)   │     │ CF "documents" — snapshots (LZ4)  │
//! └──────────────┘     │ CF "oplog"     — confirmed ops    │
//!                      │ CF "metadata"  — doc metadata     │
//!                      │ CF "wal"       — write-ahead log  │
//!                      └──────────────────────────────────┘
//! ```
//!
//! The coordinator hands every applied operation to the persist worker and
//! keeps going; saves are retried with backoff and repeated failure is
//! surfaced as degraded durability, never as a mutation failure. Recovery
//! loads the latest snapshot and replays the stored op tail on top.

pub mod oplog;
pub mod rocks;
pub mod wal;

pub use oplog::{CompressedOp, OpLog, OpLogError, OpLogStats};
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
pub use wal::{WalConfig, WalEntry, WalEntryType, WalError, WriteAheadLog};

use vellum_core::Segment;

/// Encode a materialized segment sequence for the save contract.
pub fn encode_segments(segments: &[Segment]) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(segments, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

/// Decode a persisted segment sequence.
pub fn decode_segments(bytes: &[u8]) -> Result<Vec<Segment>, StoreError> {
    let (segments, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_codec_roundtrip() {
        let segments = vec![
            Segment::text("hello"),
            Segment::newlines(1),
            Segment::image("pic.png"),
        ];
        let bytes = encode_segments(&segments).unwrap();
        let decoded = decode_segments(&bytes).unwrap();
        assert_eq!(decoded, segments);
    }

    #[test]
    fn test_segment_codec_empty() {
        let bytes = encode_segments(&[]).unwrap();
        assert!(decode_segments(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_segments(&[0xFF, 0x01, 0x02]).is_err());
    }
}
