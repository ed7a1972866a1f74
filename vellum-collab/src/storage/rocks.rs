//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — materialized segment snapshots (LZ4 compressed)
//! - `oplog`     — confirmed operations (LZ4 compressed, keyed by doc_id:version)
//! - `metadata`  — document metadata (snapshot version, counters, timestamps)
//! - `wal`       — write-ahead log entries (sequential, keyed by sequence)
//!
//! This is the persistence collaborator behind the coordinator: saves are
//! retryable, never fatal to in-memory state. `save_snapshot(document_id,
//! version, content)` is the save contract; `store_op`/`load_ops_since`
//! carry the applied-op tail so recovery replays exactly what a snapshot
//! does not cover.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

use super::wal::WalEntry;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_OPLOG: &str = "oplog";
const CF_METADATA: &str = "metadata";
const CF_WAL: &str = "wal";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPLOG, CF_METADATA, CF_WAL];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false — batch fsync instead)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vellum_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: Uuid,
    /// Highest version with a persisted operation
    pub version: u64,
    /// Version the persisted snapshot materializes
    pub snapshot_version: u64,
    /// Number of op-log entries currently stored
    pub op_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: Uuid) -> Self {
        let now = unix_seconds();
        Self {
            document_id,
            version: 0,
            snapshot_version: 0,
            op_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
///
/// Provides durable storage for collaborative documents with LZ4-compressed
/// snapshots and op-log entries, bloom filters for fast key lookup, and
/// atomic write batches for consistency.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Global sequence number for WAL entries
    sequence: AtomicU64,
}

impl DocumentStore {
    /// Open the document store at the configured path, creating the
    /// database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Snapshots are large, infrequently updated
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPLOG => {
                // Many small writes, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_WAL => {
                // Sequential writes, sequential reads during recovery
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next sequence number from the WAL column family.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_WAL) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[..8]);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a materialized document snapshot (LZ4 compressed).
    ///
    /// The persistence save contract: `(document_id, version, content)`.
    /// `content` is the bincode-encoded segment sequence at `version`.
    pub fn save_snapshot(
        &self,
        document_id: Uuid,
        version: u64,
        content: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(content);

        let mut meta = self
            .load_metadata(document_id)
            .unwrap_or_else(|_| DocumentMetadata::new(document_id));
        meta.snapshot_version = version;
        meta.version = meta.version.max(version);
        meta.snapshot_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_seconds();

        // Atomic batch write: snapshot + metadata
        let mut batch = WriteBatch::default();
        let key = document_id.as_bytes().to_vec();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load the latest snapshot: `(snapshot_version, content)`.
    pub fn load_snapshot(&self, document_id: Uuid) -> Result<(u64, Vec<u8>), StoreError> {
        let meta = self.load_metadata(document_id)?;
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = document_id.as_bytes().to_vec();

        match self.db.get_cf(&cf, &key)? {
            Some(compressed) => {
                let content = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                Ok((meta.snapshot_version, content))
            }
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    /// Check if a document exists.
    pub fn document_exists(&self, document_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, document_id.as_bytes())?.is_some())
    }

    // ─── Op log ───────────────────────────────────────────────────────

    /// Store a confirmed operation for a document.
    ///
    /// Key format: `<doc_id:16 bytes><version:8 bytes big-endian>`.
    /// Value: LZ4-compressed encoded operation.
    pub fn store_op(
        &self,
        document_id: Uuid,
        version: u64,
        op: &[u8],
    ) -> Result<u64, StoreError> {
        let cf_ops = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(op);
        let compressed_len = compressed.len() as u64;
        let key = Self::op_key(document_id, version);

        let mut meta = self
            .load_metadata(document_id)
            .unwrap_or_else(|_| DocumentMetadata::new(document_id));
        meta.version = meta.version.max(version);
        meta.op_count += 1;
        meta.updated_at = unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, &key, &compressed);
        batch.put_cf(&cf_meta, document_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(compressed_len)
    }

    /// Load operations with version >= `from_version`, in version order,
    /// LZ4 decompressed.
    pub fn load_ops_since(
        &self,
        document_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;

        let start_key = Self::op_key(document_id, from_version);
        let mut ops = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            // Stop once we've passed this document's key prefix
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }

            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            let version = u64::from_be_bytes(ver_buf);

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;

            ops.push((version, decompressed));
        }

        Ok(ops)
    }

    /// Number of op-log entries stored for a document.
    pub fn op_count(&self, document_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.load_metadata(document_id)?.op_count)
    }

    /// Delete op-log entries with version <= `up_to_version` (after a
    /// snapshot made them redundant). Returns the number removed.
    pub fn compact_ops(&self, document_id: Uuid, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let start_key = Self::op_key(document_id, 0);
        let end_key = Self::op_key(document_id, up_to_version + 1);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            if key.as_ref() >= end_key.as_slice() {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            if let Ok(mut meta) = self.load_metadata(document_id) {
                meta.op_count = meta.op_count.saturating_sub(count);
                meta.updated_at = unix_seconds();
                batch.put_cf(&cf_meta, document_id.as_bytes(), &meta.encode()?);
            }
            self.db.write(batch)?;
        }

        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load document metadata.
    pub fn load_metadata(&self, document_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    /// List all document IDs in the store.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(key.as_ref().try_into().map_err(|_| {
                    StoreError::DeserializationError("Invalid UUID key".into())
                })?);
                ids.push(id);
            }
        }

        Ok(ids)
    }

    /// Delete a document, its op log and metadata.
    pub fn delete_document(&self, document_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_ops = self.cf(CF_OPLOG)?;

        let key = document_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, &key);
        batch.delete_cf(&cf_meta, &key);

        let start_key = Self::op_key(document_id, 0);
        let iter = self.db.iterator_cf(
            &cf_ops,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_ops, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    // ─── WAL ──────────────────────────────────────────────────────────

    /// Append a batch of flushed WAL entries.
    ///
    /// Entries are keyed by their own sequence numbers; returns the highest
    /// sequence written.
    pub fn wal_append(&self, entries: &[WalEntry]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_WAL)?;
        let mut batch = WriteBatch::default();
        let mut highest = self.sequence.load(Ordering::SeqCst);

        for entry in entries {
            let encoded = entry
                .encode()
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            batch.put_cf(&cf, entry.sequence.to_be_bytes(), &encoded);
            highest = highest.max(entry.sequence);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.sequence.store(highest + 1, Ordering::SeqCst);
        Ok(highest)
    }

    /// Read all WAL entry bytes since a sequence number, in key order.
    /// Used during crash recovery; callers checksum-verify via
    /// [`super::WriteAheadLog::recover_entries`].
    pub fn wal_read_since(&self, since_seq: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_WAL)?;
        let start_key = since_seq.to_be_bytes();

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            entries.push(value.to_vec());
        }

        Ok(entries)
    }

    /// Truncate WAL entries up to a sequence number (after compaction).
    pub fn wal_truncate(&self, up_to_seq: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_WAL)?;

        let mut count = 0u64;
        let mut batch = WriteBatch::default();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 8 {
                continue;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[..8]);
            if u64::from_be_bytes(seq_buf) > up_to_seq {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
        }

        Ok(count)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Get the next WAL sequence number.
    pub fn wal_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Build an op-log key: doc_id (16 bytes) + version (8 bytes BE).
    fn op_key(document_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(document_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::WalEntryType;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        let content = b"segment bytes".to_vec();
        let meta = store.save_snapshot(doc, 7, &content).unwrap();
        assert_eq!(meta.snapshot_version, 7);
        assert_eq!(meta.snapshot_size, content.len() as u64);

        let (version, loaded) = store.load_snapshot(doc).unwrap();
        assert_eq!(version, 7);
        assert_eq!(loaded, content);
    }

    #[test]
    fn test_load_missing_snapshot() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.load_snapshot(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_document_exists() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        assert!(!store.document_exists(doc).unwrap());
        store.save_snapshot(doc, 1, b"x").unwrap();
        assert!(store.document_exists(doc).unwrap());
    }

    #[test]
    fn test_op_log_roundtrip_in_version_order() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        for v in 1..=5u64 {
            store.store_op(doc, v, format!("op_{v}").as_bytes()).unwrap();
        }

        let ops = store.load_ops_since(doc, 1).unwrap();
        assert_eq!(ops.len(), 5);
        for (i, (version, bytes)) in ops.iter().enumerate() {
            assert_eq!(*version, i as u64 + 1);
            assert_eq!(bytes, format!("op_{version}").as_bytes());
        }

        // From the middle
        let tail = store.load_ops_since(doc, 4).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 4);
    }

    #[test]
    fn test_op_log_isolated_per_document() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        store.store_op(doc_a, 1, b"a1").unwrap();
        store.store_op(doc_b, 1, b"b1").unwrap();
        store.store_op(doc_a, 2, b"a2").unwrap();

        assert_eq!(store.load_ops_since(doc_a, 1).unwrap().len(), 2);
        assert_eq!(store.load_ops_since(doc_b, 1).unwrap().len(), 1);
        assert_eq!(store.op_count(doc_a).unwrap(), 2);
    }

    #[test]
    fn test_compact_ops() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        for v in 1..=10u64 {
            store.store_op(doc, v, b"op").unwrap();
        }

        let removed = store.compact_ops(doc, 7).unwrap();
        assert_eq!(removed, 7);

        let remaining = store.load_ops_since(doc, 1).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].0, 8);
        assert_eq!(store.op_count(doc).unwrap(), 3);
    }

    #[test]
    fn test_metadata_tracks_versions() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        store.store_op(doc, 1, b"op").unwrap();
        store.store_op(doc, 2, b"op").unwrap();
        store.save_snapshot(doc, 2, b"snap").unwrap();

        let meta = store.load_metadata(doc).unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(meta.snapshot_version, 2);
        assert_eq!(meta.op_count, 2);
    }

    #[test]
    fn test_list_documents() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        store.save_snapshot(doc_a, 1, b"a").unwrap();
        store.save_snapshot(doc_b, 1, b"b").unwrap();

        let ids = store.list_documents().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&doc_a));
        assert!(ids.contains(&doc_b));
    }

    #[test]
    fn test_delete_document() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        store.save_snapshot(doc, 1, b"snap").unwrap();
        store.store_op(doc, 1, b"op").unwrap();
        store.delete_document(doc).unwrap();

        assert!(!store.document_exists(doc).unwrap());
        assert!(store.load_ops_since(doc, 1).unwrap().is_empty());
    }

    #[test]
    fn test_wal_append_and_read() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        let entries: Vec<WalEntry> = (0..3u64)
            .map(|i| WalEntry::new(i, WalEntryType::Op, doc, i + 1, vec![i as u8]))
            .collect();

        let highest = store.wal_append(&entries).unwrap();
        assert_eq!(highest, 2);
        assert_eq!(store.wal_sequence(), 3);

        let raw = store.wal_read_since(0).unwrap();
        assert_eq!(raw.len(), 3);
        let (recovered, corrupted) = crate::storage::WriteAheadLog::recover_entries(&raw);
        assert_eq!(recovered.len(), 3);
        assert_eq!(corrupted, 0);
        assert_eq!(recovered[2].version, 3);
    }

    #[test]
    fn test_wal_truncate() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = Uuid::new_v4();

        let entries: Vec<WalEntry> = (0..5u64)
            .map(|i| WalEntry::new(i, WalEntryType::Op, doc, i + 1, vec![i as u8]))
            .collect();
        store.wal_append(&entries).unwrap();

        let removed = store.wal_truncate(2).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.wal_read_since(0).unwrap().len(), 2);
    }

    #[test]
    fn test_wal_sequence_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let doc = Uuid::new_v4();

        {
            let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
            let entries = vec![WalEntry::new(0, WalEntryType::Op, doc, 1, b"x".to_vec())];
            store.wal_append(&entries).unwrap();
        }

        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.wal_sequence(), 1);
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let doc = Uuid::new_v4();

        {
            let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_snapshot(doc, 9, b"durable").unwrap();
            store.store_op(doc, 10, b"tail_op").unwrap();
        }

        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        let (version, content) = store.load_snapshot(doc).unwrap();
        assert_eq!(version, 9);
        assert_eq!(content, b"durable");
        let tail = store.load_ops_since(doc, 10).unwrap();
        assert_eq!(tail.len(), 1);
    }
}
