//! Compressed applied-operation history with snapshot compaction.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  OpLog                        │
//! │                                              │
//! │  Base segments ◄── op ◄── op ◄── op          │
//! │  (version B)      (LZ4)  (LZ4)  (LZ4)        │
//! │                                              │
//! │  Compaction: replay ops onto the base,       │
//! │  producing a new base at the head version    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The persist worker keeps one `OpLog` per document: every confirmed
//! operation is appended LZ4-compressed, and once the threshold is reached
//! the ops are replayed onto the base segments to produce a fresh snapshot.
//! Durability lag is acceptable; the in-memory coordinator never waits.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Log-Structured Storage)

use uuid::Uuid;

use serde::{Deserialize, Serialize};
use vellum_core::{Document, Segment};

use crate::protocol::ConfirmedOp;

/// A single LZ4-compressed confirmed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedOp {
    /// Document version this operation produced
    pub version: u64,
    /// Original uncompressed size in bytes
    pub original_size: u32,
    /// LZ4-compressed encoded [`ConfirmedOp`]
    pub compressed: Vec<u8>,
}

impl CompressedOp {
    /// Compress encoded operation bytes (LZ4 block mode).
    pub fn compress(version: u64, data: &[u8]) -> Self {
        let compressed = lz4_flex::compress_prepend_size(data);
        Self {
            version,
            original_size: data.len() as u32,
            compressed,
        }
    }

    /// Decompress back to the encoded operation bytes.
    pub fn decompress(&self) -> Result<Vec<u8>, OpLogError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| OpLogError::DecompressionFailed(e.to_string()))
    }

    /// Compression ratio (original / compressed).
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}

/// Op-log errors.
#[derive(Debug, Clone)]
pub enum OpLogError {
    DecompressionFailed(String),
    DecodeFailed(String),
    EmptyLog,
    VersionGap { expected: u64, got: u64 },
}

impl std::fmt::Display for OpLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpLogError::DecompressionFailed(e) => write!(f, "Decompression failed: {e}"),
            OpLogError::DecodeFailed(e) => write!(f, "Operation decode failed: {e}"),
            OpLogError::EmptyLog => write!(f, "Op log is empty"),
            OpLogError::VersionGap { expected, got } => {
                write!(f, "Version gap: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for OpLogError {}

/// Statistics for an op log.
#[derive(Debug, Clone, Default)]
pub struct OpLogStats {
    pub op_count: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    /// Version of the base segments (last compaction point)
    pub base_version: u64,
    /// Highest version appended
    pub head_version: u64,
}

impl OpLogStats {
    /// Overall compression ratio across all stored ops.
    pub fn compression_ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            return 0.0;
        }
        self.total_original_bytes as f64 / self.total_compressed_bytes as f64
    }
}

/// In-memory compressed op history over a base snapshot.
pub struct OpLog {
    document_id: Uuid,
    base_segments: Vec<Segment>,
    base_version: u64,
    ops: Vec<CompressedOp>,
    head_version: u64,
    compaction_threshold: usize,
}

impl OpLog {
    /// Create over an initial base. `compaction_threshold` is the number of
    /// ops buffered before [`OpLog::needs_compaction`] turns true.
    pub fn new(
        document_id: Uuid,
        base_version: u64,
        base_segments: Vec<Segment>,
        compaction_threshold: usize,
    ) -> Self {
        Self {
            document_id,
            base_segments,
            base_version,
            ops: Vec::with_capacity(compaction_threshold),
            head_version: base_version,
            compaction_threshold,
        }
    }

    /// Create over an empty document with the default threshold (64 ops).
    pub fn empty(document_id: Uuid) -> Self {
        Self::new(document_id, 0, Vec::new(), 64)
    }

    /// Append a confirmed operation's encoded bytes.
    ///
    /// Versions must be contiguous from the head; a gap means the worker
    /// and coordinator disagree about history and compaction would corrupt
    /// the base.
    pub fn append(&mut self, version: u64, op_bytes: &[u8]) -> Result<bool, OpLogError> {
        let expected = self.head_version + 1;
        if version != expected {
            return Err(OpLogError::VersionGap { expected, got: version });
        }
        self.ops.push(CompressedOp::compress(version, op_bytes));
        self.head_version = version;
        Ok(self.needs_compaction())
    }

    pub fn needs_compaction(&self) -> bool {
        self.ops.len() >= self.compaction_threshold
    }

    /// Replay all buffered ops onto the base, producing a new base at the
    /// head version. Returns the stats from before compaction.
    pub fn compact(&mut self) -> Result<OpLogStats, OpLogError> {
        if self.ops.is_empty() {
            return Err(OpLogError::EmptyLog);
        }

        let stats_before = self.stats();

        let mut doc = Document::restore(
            self.document_id,
            self.base_version,
            std::mem::take(&mut self.base_segments),
        );
        for op in &self.ops {
            let bytes = op.decompress()?;
            let confirmed = ConfirmedOp::decode(&bytes)
                .map_err(|e| OpLogError::DecodeFailed(e.to_string()))?;
            doc.apply(confirmed.op);
        }

        self.base_segments = doc.snapshot().segments;
        self.base_version = self.head_version;
        self.ops.clear();

        Ok(stats_before)
    }

    /// Current base segments (uncompressed).
    pub fn base_segments(&self) -> &[Segment] {
        &self.base_segments
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn head_version(&self) -> u64 {
        self.head_version
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn stats(&self) -> OpLogStats {
        OpLogStats {
            op_count: self.ops.len() as u64,
            total_original_bytes: self.ops.iter().map(|o| o.original_size as u64).sum(),
            total_compressed_bytes: self.ops.iter().map(|o| o.compressed.len() as u64).sum(),
            base_version: self.base_version,
            head_version: self.head_version,
        }
    }
}
