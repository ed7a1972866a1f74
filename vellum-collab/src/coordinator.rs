//! Per-document synchronization coordinators.
//!
//! Architecture:
//! ```text
//! Submit ──► inbound mpsc (FIFO per document)
//!                 │
//!                 ▼
//!        ┌─────────────────────────────────────────────┐
//!        │ DocumentCoordinator (one tokio task per doc)│
//!        │                                             │
//!        │  Idle ─► Resolving ─► Applying ─► Broadcast │
//!        │   ▲                                   │     │
//!        │   └───────────────────────────────────┘     │
//!        └──────┬───────────────────┬──────────────────┘
//!               │ ConfirmedOp       │ PersistJob
//!               ▼                   ▼
//!        BroadcastGroup       persist worker ──► DocumentStore
//!        (all sessions)       (retry + backoff, WAL, compaction)
//! ```
//!
//! Exactly one operation is in flight per document; different documents run
//! fully in parallel. The coordinator exclusively owns its `Document` and
//! applied-op log — external readers get versioned snapshots. It may
//! suspend only while handing off to broadcast or persistence, never while
//! the document is mid-apply.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use vellum_core::{transform, Document, DocumentSnapshot, Operation, ResolvedOp};

use crate::broadcast::BroadcastGroup;
use crate::protocol::{ConfirmedOp, ProtocolError, RejectReason, Rejection, SessionInfo, SyncMessage};
use crate::session::SessionRegistry;
use crate::storage::{
    decode_segments, encode_segments, DocumentStore, OpLog, StoreError, WalConfig, WriteAheadLog,
};

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Inbound command queue capacity per document
    pub inbound_capacity: usize,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Persist-job queue capacity per document
    pub persist_capacity: usize,
    /// Ops buffered before the persist worker compacts into a snapshot
    pub compaction_threshold: usize,
    /// Base delay for persistence retries (doubles per attempt)
    pub persist_retry_base_ms: u64,
    /// Persistence attempts before declaring degraded durability
    pub persist_retry_limit: u32,
    /// Write-ahead log buffering for the persist worker
    pub wal: WalConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 256,
            broadcast_capacity: 256,
            persist_capacity: 64,
            compaction_threshold: 64,
            persist_retry_base_ms: 50,
            persist_retry_limit: 5,
            wal: WalConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Config for testing (tiny buffers, fast retries, eager compaction).
    pub fn for_testing() -> Self {
        Self {
            inbound_capacity: 16,
            broadcast_capacity: 16,
            persist_capacity: 8,
            compaction_threshold: 4,
            persist_retry_base_ms: 1,
            persist_retry_limit: 2,
            wal: WalConfig::for_testing(),
        }
    }
}

/// State machine phases. One operation occupies Resolving → Applying →
/// Broadcasting at a time; the machine has no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Resolving,
    Applying,
    Broadcasting,
}

impl CoordinatorState {
    fn code(self) -> u64 {
        match self {
            CoordinatorState::Idle => 0,
            CoordinatorState::Resolving => 1,
            CoordinatorState::Applying => 2,
            CoordinatorState::Broadcasting => 3,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            1 => CoordinatorState::Resolving,
            2 => CoordinatorState::Applying,
            3 => CoordinatorState::Broadcasting,
            _ => CoordinatorState::Idle,
        }
    }
}

/// Counters shared between the coordinator task and its handle.
struct SharedStats {
    state: AtomicU64,
    ops_applied: AtomicU64,
    ops_rejected: AtomicU64,
    ops_duplicate: AtomicU64,
    ops_cancelled: AtomicU64,
    transforms: AtomicU64,
    degraded_durability: AtomicBool,
}

impl SharedStats {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            ops_applied: AtomicU64::new(0),
            ops_rejected: AtomicU64::new(0),
            ops_duplicate: AtomicU64::new(0),
            ops_cancelled: AtomicU64::new(0),
            transforms: AtomicU64::new(0),
            degraded_durability: AtomicBool::new(false),
        }
    }
}

/// Snapshot of a coordinator's counters.
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    pub state: CoordinatorState,
    pub ops_applied: u64,
    pub ops_rejected: u64,
    pub ops_duplicate: u64,
    pub ops_cancelled: u64,
    pub transforms: u64,
    /// True once persistence has exhausted its retries at least once.
    /// The in-memory document stays available and correct regardless.
    pub degraded_durability: bool,
}

/// Outcome of submitting one operation.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Applied and broadcast; the confirmation carries the new version.
    Applied(ConfirmedOp),
    /// The operation id was already applied — idempotent acknowledgment,
    /// no state change. Carries the original confirmation.
    AlreadyApplied(ConfirmedOp),
    /// Rejected; local to this operation, nothing else is affected.
    Rejected(Rejection),
    /// Dropped before Resolving because the submitting client disconnected.
    Cancelled,
}

enum Command {
    Submit {
        op: Operation,
        reply: Option<oneshot::Sender<SubmitOutcome>>,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
    SessionOpened {
        info: SessionInfo,
    },
    SessionClosed {
        client_id: Uuid,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct PersistJob {
    version: u64,
    op_bytes: Vec<u8>,
}

/// The per-document coordinator task state.
struct DocumentCoordinator {
    document: Document,
    broadcast: Arc<BroadcastGroup>,
    sessions: SessionRegistry,
    cancelled: Arc<StdMutex<HashSet<Uuid>>>,
    persist_tx: Option<mpsc::Sender<PersistJob>>,
    persist_task: Option<tokio::task::JoinHandle<()>>,
    stats: Arc<SharedStats>,
}

impl DocumentCoordinator {
    /// Advance the state machine; observable through the handle's stats.
    fn set_state(&self, state: CoordinatorState) {
        self.stats.state.store(state.code(), Ordering::Relaxed);
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let doc_id = self.document.id();
        log::info!("Coordinator started for document {doc_id}");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Submit { op, reply } => {
                    let outcome = self.handle_submit(op).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.document.snapshot());
                }
                Command::SessionOpened { info } => {
                    self.cancelled.lock().unwrap().remove(&info.client_id);
                    log::info!(
                        "Session {} ({}) joined document {doc_id}",
                        info.name,
                        info.client_id
                    );
                    self.sessions.open(info.clone(), self.document.version());
                    let _ = self.broadcast.send(&SyncMessage::session_joined(&info, doc_id));
                }
                Command::SessionClosed { client_id } => {
                    // All Submits queued before this command have drained
                    // (FIFO), so the cancellation flag has done its job.
                    self.cancelled.lock().unwrap().remove(&client_id);
                    if let Some(session) = self.sessions.close(&client_id) {
                        log::info!(
                            "Session {} ({client_id}) left document {doc_id} (acked through {})",
                            session.name,
                            session.last_acked_version
                        );
                    }
                    let _ = self.broadcast.send(&SyncMessage::session_left(client_id, doc_id));
                }
                Command::Shutdown { reply } => {
                    // Closing the job channel lets the persist worker flush
                    // and write a final snapshot before we acknowledge.
                    drop(self.persist_tx.take());
                    if let Some(task) = self.persist_task.take() {
                        let _ = task.await;
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }

        log::info!("Coordinator stopped for document {doc_id}");
    }

    /// Drive one operation through Resolving → Applying → Broadcasting.
    async fn handle_submit(&mut self, op: Operation) -> SubmitOutcome {
        // A disconnect cancels the client's queued operations before they
        // enter Resolving; anything already applied stays applied.
        if self.cancelled.lock().unwrap().contains(&op.client_id()) {
            self.stats.ops_cancelled.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping cancelled op {} (client disconnected)", op.id);
            return SubmitOutcome::Cancelled;
        }

        self.set_state(CoordinatorState::Resolving);

        // Idempotent acknowledgment: a resubmitted operation re-confirms
        // with its original version, no document mutation.
        if let Some(entry) = self.document.applied(&op.id) {
            self.stats.ops_duplicate.fetch_add(1, Ordering::Relaxed);
            let confirmed = ConfirmedOp {
                applied_version: entry.version,
                op: entry.op.clone(),
            };
            self.set_state(CoordinatorState::Idle);
            return SubmitOutcome::AlreadyApplied(confirmed);
        }

        let server_version = self.document.version();

        // Position bounds only mean something against the state the client
        // actually saw; a stale operation gets structural checks here and
        // bounds handling from the transform engine's clamping.
        let validation = if op.base_version == server_version {
            op.validate(self.document.unit_len())
        } else {
            op.validate_structure()
        };
        if let Err(reason) = validation {
            return self.reject(&op, RejectReason::Malformed(reason));
        }

        if op.base_version > server_version {
            // Client claims to have seen a future version: protocol
            // violation, resynchronize from a snapshot.
            return self.reject(
                &op,
                RejectReason::VersionAhead {
                    base_version: op.base_version,
                    server_version,
                },
            );
        }
        if op.base_version < self.document.log_start_version() {
            // The transform basis predates the in-memory log tail.
            return self.reject(
                &op,
                RejectReason::ResyncRequired {
                    base_version: op.base_version,
                    log_start: self.document.log_start_version(),
                },
            );
        }

        // Rebase across everything applied since the client's base version.
        let mut resolved = ResolvedOp::from_operation(&op);
        for entry in self.document.log_since(op.base_version) {
            resolved = transform(&resolved, &entry.op);
            self.stats.transforms.fetch_add(1, Ordering::Relaxed);
        }

        // Atomic, non-interruptible apply.
        self.set_state(CoordinatorState::Applying);
        let applied_version = self.document.apply(resolved);
        let entry = self
            .document
            .log()
            .last()
            .expect("apply always appends a log entry");
        let confirmed = ConfirmedOp {
            applied_version,
            op: entry.op.clone(),
        };

        self.set_state(CoordinatorState::Broadcasting);
        let doc_id = self.document.id();
        let _ = self.broadcast.send(&SyncMessage::confirm(doc_id, &confirmed));
        self.sessions.record_ack(&op.client_id(), applied_version);
        self.stats.ops_applied.fetch_add(1, Ordering::Relaxed);

        // Hand off to persistence; durability lag is fine, blocking is not.
        if let Some(tx) = &self.persist_tx {
            match confirmed.encode() {
                Ok(op_bytes) => {
                    let job = PersistJob { version: applied_version, op_bytes };
                    if tx.send(job).await.is_err() {
                        log::error!("Persist worker gone for document {doc_id}");
                        self.stats.degraded_durability.store(true, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    log::error!("Failed to encode confirmed op for persistence: {e}");
                    self.stats.degraded_durability.store(true, Ordering::Relaxed);
                }
            }
        }

        self.set_state(CoordinatorState::Idle);
        SubmitOutcome::Applied(confirmed)
    }

    fn reject(&mut self, op: &Operation, reason: RejectReason) -> SubmitOutcome {
        self.stats.ops_rejected.fetch_add(1, Ordering::Relaxed);
        log::debug!("Rejecting op {}: {reason}", op.id);
        let rejection = Rejection {
            op_id: op.id,
            reason,
            server_version: self.document.version(),
        };
        self.set_state(CoordinatorState::Idle);
        SubmitOutcome::Rejected(rejection)
    }
}

/// Handle to a running coordinator. Cheap to clone.
#[derive(Clone)]
pub struct CoordinatorHandle {
    document_id: Uuid,
    tx: mpsc::Sender<Command>,
    broadcast: Arc<BroadcastGroup>,
    cancelled: Arc<StdMutex<HashSet<Uuid>>>,
    stats: Arc<SharedStats>,
}

impl CoordinatorHandle {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Submit an operation and wait for its outcome.
    pub async fn submit(&self, op: Operation) -> Result<SubmitOutcome, ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { op, reply: Some(reply_tx) })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Submit without waiting; the confirmation arrives via broadcast.
    pub async fn submit_nowait(&self, op: Operation) -> Result<(), ProtocolError> {
        self.tx
            .send(Command::Submit { op, reply: None })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Fetch the published, versioned snapshot.
    pub async fn snapshot(&self) -> Result<DocumentSnapshot, ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Register a session (clears any pending cancellation flag).
    pub async fn session_opened(&self, info: SessionInfo) -> Result<(), ProtocolError> {
        self.tx
            .send(Command::SessionOpened { info })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Deregister a session.
    pub async fn session_closed(&self, client_id: Uuid) -> Result<(), ProtocolError> {
        self.tx
            .send(Command::SessionClosed { client_id })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Flag a client's queued, not-yet-resolving operations for cancellation.
    ///
    /// Synchronous on purpose: the server calls this the moment a
    /// disconnect is detected, before the queue drains.
    pub fn cancel_pending(&self, client_id: Uuid) {
        self.cancelled.lock().unwrap().insert(client_id);
    }

    /// Subscribe to this document's confirmation fan-out.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<Vec<u8>>> {
        self.broadcast.subscribe()
    }

    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            state: CoordinatorState::from_code(self.stats.state.load(Ordering::Relaxed)),
            ops_applied: self.stats.ops_applied.load(Ordering::Relaxed),
            ops_rejected: self.stats.ops_rejected.load(Ordering::Relaxed),
            ops_duplicate: self.stats.ops_duplicate.load(Ordering::Relaxed),
            ops_cancelled: self.stats.ops_cancelled.load(Ordering::Relaxed),
            transforms: self.stats.transforms.load(Ordering::Relaxed),
            degraded_durability: self.stats.degraded_durability.load(Ordering::Relaxed),
        }
    }

    /// Stop the coordinator, flushing persistence first.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Partitions the inbound stream by document id: all operations for one
/// document reach the same coordinator task in arrival order, and different
/// documents run fully in parallel.
pub struct CoordinatorPool {
    config: CoordinatorConfig,
    handles: RwLock<HashMap<Uuid, CoordinatorHandle>>,
    store: Option<Arc<DocumentStore>>,
}

impl CoordinatorPool {
    pub fn new(config: CoordinatorConfig, store: Option<Arc<DocumentStore>>) -> Self {
        Self {
            config,
            handles: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Get the coordinator for a document, spawning (and recovering from
    /// storage) if needed.
    pub async fn get_or_create(&self, document_id: Uuid) -> Result<CoordinatorHandle, StoreError> {
        // Fast path: read lock
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(&document_id) {
                return Ok(handle.clone());
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(&document_id) {
            return Ok(handle.clone());
        }

        let document = match &self.store {
            Some(store) => {
                if store.document_exists(document_id)? {
                    recover_document(store, document_id)?
                } else {
                    Document::new(document_id)
                }
            }
            None => Document::new(document_id),
        };

        let handle = spawn_coordinator(document, self.config.clone(), self.store.clone());
        handles.insert(document_id, handle.clone());
        Ok(handle)
    }

    /// Get an existing coordinator without spawning.
    pub async fn get(&self, document_id: Uuid) -> Option<CoordinatorHandle> {
        self.handles.read().await.get(&document_id).cloned()
    }

    /// Spawn coordinators for every persisted document. Returns how many
    /// documents were recovered.
    pub async fn recover_all(&self) -> Result<usize, StoreError> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(0),
        };

        let ids = store.list_documents()?;
        let mut recovered = 0;
        for id in &ids {
            self.get_or_create(*id).await?;
            recovered += 1;
            log::info!("Recovered document {id} from storage");
        }
        log::info!("Recovery complete: {recovered}/{} documents restored", ids.len());
        Ok(recovered)
    }

    pub async fn document_count(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn document_ids(&self) -> Vec<Uuid> {
        self.handles.read().await.keys().cloned().collect()
    }

    /// Shut down every coordinator, flushing persistence.
    pub async fn shutdown_all(&self) {
        let handles: Vec<CoordinatorHandle> = {
            let mut guard = self.handles.write().await;
            guard.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.shutdown().await;
        }
    }
}

/// Rebuild a document from its snapshot plus the stored op tail.
fn recover_document(store: &DocumentStore, document_id: Uuid) -> Result<Document, StoreError> {
    let (snapshot_version, content) = match store.load_snapshot(document_id) {
        Ok(found) => found,
        // Ops were stored but no snapshot yet: replay from empty.
        Err(StoreError::NotFound(_)) => (0, encode_segments(&[])?),
        Err(e) => return Err(e),
    };
    let segments = decode_segments(&content)?;
    let mut document = Document::restore(document_id, snapshot_version, segments);

    for (version, op_bytes) in store.load_ops_since(document_id, snapshot_version + 1)? {
        match ConfirmedOp::decode(&op_bytes) {
            Ok(confirmed) => {
                let applied = document.apply(confirmed.op);
                if applied != version {
                    log::warn!(
                        "Version drift replaying document {document_id}: op tagged {version}, applied as {applied}"
                    );
                }
            }
            Err(e) => {
                log::error!("Skipping undecodable stored op v{version} for {document_id}: {e}");
            }
        }
    }

    log::info!(
        "Restored document {document_id} at version {} (snapshot {snapshot_version} + op tail)",
        document.version()
    );
    Ok(document)
}

fn spawn_coordinator(
    document: Document,
    config: CoordinatorConfig,
    store: Option<Arc<DocumentStore>>,
) -> CoordinatorHandle {
    let document_id = document.id();
    let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
    let cancelled = Arc::new(StdMutex::new(HashSet::new()));
    let stats = Arc::new(SharedStats::new());

    let (persist_tx, persist_task) = match store {
        Some(store) => {
            let (tx, rx) = mpsc::channel(config.persist_capacity);
            let task = tokio::spawn(persist_worker(
                store,
                document_id,
                rx,
                stats.clone(),
                config.clone(),
            ));
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    let (tx, rx) = mpsc::channel(config.inbound_capacity);
    let coordinator = DocumentCoordinator {
        document,
        broadcast: broadcast.clone(),
        sessions: SessionRegistry::new(),
        cancelled: cancelled.clone(),
        persist_tx,
        persist_task,
        stats: stats.clone(),
    };
    tokio::spawn(coordinator.run(rx));

    CoordinatorHandle {
        document_id,
        tx,
        broadcast,
        cancelled,
        stats,
    }
}

/// The persistence side of one document: WAL buffering, compressed op-log
/// writes with retry/backoff, and snapshot compaction.
async fn persist_worker(
    store: Arc<DocumentStore>,
    document_id: Uuid,
    mut rx: mpsc::Receiver<PersistJob>,
    stats: Arc<SharedStats>,
    config: CoordinatorConfig,
) {
    let mut wal = WriteAheadLog::from_sequence(config.wal.clone(), store.wal_sequence());

    // Seed the in-memory op log from whatever is already persisted so its
    // head lines up with the coordinator's version sequence.
    let mut oplog = match store.load_snapshot(document_id) {
        Ok((version, content)) => match decode_segments(&content) {
            Ok(segments) => OpLog::new(document_id, version, segments, config.compaction_threshold),
            Err(e) => {
                log::error!("Undecodable persisted snapshot for {document_id}: {e}");
                OpLog::new(document_id, version, Vec::new(), config.compaction_threshold)
            }
        },
        Err(_) => OpLog::new(document_id, 0, Vec::new(), config.compaction_threshold),
    };
    if let Ok(tail) = store.load_ops_since(document_id, oplog.head_version() + 1) {
        for (version, op_bytes) in tail {
            if let Err(e) = oplog.append(version, &op_bytes) {
                log::warn!("Skipping stored op v{version} while seeding op log: {e}");
            }
        }
    }

    while let Some(job) = rx.recv().await {
        // WAL first: crash-safe record of the op before anything else.
        match wal.append_op(document_id, job.version, job.op_bytes.clone()) {
            Ok((_, needs_flush)) => {
                if needs_flush {
                    flush_wal(&store, &mut wal, &stats);
                }
            }
            Err(e) => log::error!("WAL append failed for {document_id} v{}: {e}", job.version),
        }

        // Durable op-log entry, retried with backoff.
        let saved = with_retry(&config, || {
            store.store_op(document_id, job.version, &job.op_bytes)
        })
        .await;
        if let Err(e) = saved {
            log::error!(
                "Dropping durable write of op v{} for {document_id} after retries: {e}",
                job.version
            );
            stats.degraded_durability.store(true, Ordering::Relaxed);
        }

        // In-memory compressed history; drives compaction.
        match oplog.append(job.version, &job.op_bytes) {
            Ok(true) => compact(&store, &mut wal, &mut oplog, &stats, &config).await,
            Ok(false) => {}
            Err(e) => log::error!("Op log append failed for {document_id} v{}: {e}", job.version),
        }
    }

    // Channel closed: flush everything and leave a fresh snapshot behind.
    if oplog.op_count() > 0 {
        compact(&store, &mut wal, &mut oplog, &stats, &config).await;
    }
    flush_wal(&store, &mut wal, &stats);
    if let Err(e) = store.sync() {
        log::warn!("Final store sync failed for {document_id}: {e}");
    }
    log::debug!("Persist worker stopped for document {document_id}");
}

/// Replay buffered ops into a new base snapshot, persist it, and drop the
/// op-log and WAL entries it covers.
async fn compact(
    store: &Arc<DocumentStore>,
    wal: &mut WriteAheadLog,
    oplog: &mut OpLog,
    stats: &Arc<SharedStats>,
    config: &CoordinatorConfig,
) {
    let document_id = oplog.document_id();
    let before = match oplog.compact() {
        Ok(stats) => stats,
        Err(e) => {
            log::error!("Compaction failed for {document_id}: {e}");
            return;
        }
    };

    let snapshot_version = oplog.base_version();
    let content = match encode_segments(oplog.base_segments()) {
        Ok(content) => content,
        Err(e) => {
            log::error!("Snapshot encode failed for {document_id}: {e}");
            return;
        }
    };

    let saved = with_retry(config, || {
        store.save_snapshot(document_id, snapshot_version, &content)
    })
    .await;
    match saved {
        Ok(_) => {
            if let Err(e) = store.compact_ops(document_id, snapshot_version) {
                log::warn!("Op-log compaction failed for {document_id}: {e}");
            }
            // Checkpoint: everything up to here is covered by the snapshot.
            if let Ok((checkpoint_seq, _)) = wal.append_checkpoint(document_id) {
                flush_wal(store, wal, stats);
                if let Err(e) = store.wal_truncate(checkpoint_seq) {
                    log::warn!("WAL truncation failed for {document_id}: {e}");
                }
            }
            log::info!(
                "Compacted {} ops into snapshot v{snapshot_version} for {document_id} ({:.1}:1 compression)",
                before.op_count,
                before.compression_ratio()
            );
        }
        Err(e) => {
            log::error!("Snapshot save failed for {document_id} after retries: {e}");
            stats.degraded_durability.store(true, Ordering::Relaxed);
        }
    }
}

fn flush_wal(store: &Arc<DocumentStore>, wal: &mut WriteAheadLog, stats: &Arc<SharedStats>) {
    let entries = wal.flush();
    if entries.is_empty() {
        return;
    }
    if let Err(e) = store.wal_append(&entries) {
        log::error!("WAL batch write failed ({} entries): {e}", entries.len());
        stats.degraded_durability.store(true, Ordering::Relaxed);
    }
}

/// Run a store call with exponential backoff. Failure is retryable and
/// never fatal to in-memory state.
async fn with_retry<T>(
    config: &CoordinatorConfig,
    mut call: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut delay = Duration::from_millis(config.persist_retry_base_ms);
    let mut last_err = None;
    for attempt in 0..config.persist_retry_limit {
        match call() {
            Ok(value) => return Ok(value),
            Err(e) => {
                log::warn!("Persistence attempt {} failed: {e}", attempt + 1);
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::DatabaseError("retry limit is zero".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::{DocumentRenderer, ElementKind, ElementPayload, ResolvedKind};

    fn doc_id() -> Uuid {
        Uuid::from_u128(0xD0C)
    }

    fn client(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn pool() -> CoordinatorPool {
        CoordinatorPool::new(CoordinatorConfig::for_testing(), None)
    }

    fn insert(client_n: u128, seq: u64, base: u64, pos: u64, text: &str) -> Operation {
        Operation::insert(
            doc_id(),
            client(client_n),
            seq,
            base,
            pos,
            ElementPayload::Text(text.into()),
            1000 + seq,
        )
    }

    async fn applied_version(handle: &CoordinatorHandle, op: Operation) -> u64 {
        match handle.submit(op).await.unwrap() {
            SubmitOutcome::Applied(c) => c.applied_version,
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_inserts() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();

        assert_eq!(applied_version(&handle, insert(1, 1, 0, 0, "Hello")).await, 1);
        assert_eq!(applied_version(&handle, insert(1, 2, 1, 5, " World")).await, 2);

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.version, 2);
        assert_eq!(snap.unit_len(), 11);
    }

    #[tokio::test]
    async fn test_stale_op_is_rebased() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();

        applied_version(&handle, insert(1, 1, 0, 0, "Hello World")).await;

        // Two concurrent inserts at position 6, both based on version 1.
        applied_version(&handle, insert(1, 2, 1, 6, "beautiful ")).await;
        let outcome = handle.submit(insert(2, 1, 1, 6, "amazing ")).await.unwrap();

        match outcome {
            SubmitOutcome::Applied(c) => {
                assert_eq!(c.applied_version, 3);
                match c.op.kind {
                    ResolvedKind::Insert { position, .. } => assert_eq!(position, 16),
                    other => panic!("expected insert, got {other:?}"),
                }
            }
            other => panic!("expected Applied, got {other:?}"),
        }

        let stats = handle.stats();
        assert_eq!(stats.ops_applied, 3);
        assert_eq!(stats.transforms, 1);
    }

    #[tokio::test]
    async fn test_version_ahead_rejected() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();

        let outcome = handle.submit(insert(1, 1, 5, 0, "x")).await.unwrap();
        match outcome {
            SubmitOutcome::Rejected(r) => {
                assert!(matches!(r.reason, RejectReason::VersionAhead { base_version: 5, server_version: 0 }));
                assert_eq!(r.server_version, 0);
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(handle.stats().ops_rejected, 1);
    }

    #[tokio::test]
    async fn test_malformed_rejected_without_mutation() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();

        let op = Operation::insert(
            doc_id(),
            client(1),
            1,
            0,
            0,
            ElementPayload::Text(String::new()),
            1000,
        );
        let outcome = handle.submit(op).await.unwrap();
        assert!(matches!(
            outcome,
            SubmitOutcome::Rejected(Rejection { reason: RejectReason::Malformed(_), .. })
        ));

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.version, 0);
    }

    #[tokio::test]
    async fn test_idempotent_resubmission() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();

        let op = insert(1, 1, 0, 0, "once");
        applied_version(&handle, op.clone()).await;

        // Same operation id again, even with a different base version.
        let mut resubmit = op.clone();
        resubmit.base_version = 1;
        match handle.submit(resubmit).await.unwrap() {
            SubmitOutcome::AlreadyApplied(c) => assert_eq!(c.applied_version, 1),
            other => panic!("expected AlreadyApplied, got {other:?}"),
        }

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.unit_len(), 4);
        assert_eq!(handle.stats().ops_duplicate, 1);
    }

    #[tokio::test]
    async fn test_cancellation_drops_queued_ops() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();

        handle.cancel_pending(client(1));
        match handle.submit(insert(1, 1, 0, 0, "late")).await.unwrap() {
            SubmitOutcome::Cancelled => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }

        // Other clients are unaffected.
        assert_eq!(applied_version(&handle, insert(2, 1, 0, 0, "ok")).await, 1);
        assert_eq!(handle.stats().ops_cancelled, 1);
    }

    #[tokio::test]
    async fn test_session_open_clears_cancellation() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();

        handle.cancel_pending(client(1));
        handle
            .session_opened(SessionInfo::with_id(client(1), "Alice"))
            .await
            .unwrap();

        assert_eq!(applied_version(&handle, insert(1, 1, 0, 0, "back")).await, 1);
    }

    #[tokio::test]
    async fn test_confirmations_fan_out_to_subscribers() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();
        let mut rx = handle.subscribe();

        applied_version(&handle, insert(1, 1, 0, 0, "hi")).await;

        let bytes = rx.recv().await.unwrap();
        let msg = SyncMessage::decode(&bytes).unwrap();
        let confirmed = msg.confirmed().unwrap();
        assert_eq!(confirmed.applied_version, 1);
        assert_eq!(confirmed.op.client_id(), client(1));
    }

    #[tokio::test]
    async fn test_delete_insert_scenario() {
        // "abcdef" at version 1; concurrent Delete(1, 3) and Insert(2, "X").
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();
        applied_version(&handle, insert(1, 1, 0, 0, "abcdef")).await;

        let delete = Operation::delete(
            doc_id(),
            client(1),
            2,
            1,
            1,
            3,
            ElementKind::Text,
            2000,
        );
        let ins_x = insert(2, 1, 1, 2, "X");

        applied_version(&handle, delete).await;
        applied_version(&handle, ins_x).await;

        let snap = handle.snapshot().await.unwrap();
        let rendered = vellum_core::PlainTextRenderer.render(&snap.segments);
        assert_eq!(rendered, "aXef");
        assert_eq!(snap.version, 3);
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let pool = pool();
        let doc_a = Uuid::from_u128(0xA);
        let doc_b = Uuid::from_u128(0xB);

        let handle_a = pool.get_or_create(doc_a).await.unwrap();
        let handle_b = pool.get_or_create(doc_b).await.unwrap();

        let op_a = Operation::insert(
            doc_a,
            client(1),
            1,
            0,
            0,
            ElementPayload::Text("doc a".into()),
            1000,
        );
        let op_b = Operation::insert(
            doc_b,
            client(2),
            1,
            0,
            0,
            ElementPayload::Text("document b".into()),
            1000,
        );

        match (
            handle_a.submit(op_a).await.unwrap(),
            handle_b.submit(op_b).await.unwrap(),
        ) {
            (SubmitOutcome::Applied(a), SubmitOutcome::Applied(b)) => {
                assert_eq!(a.applied_version, 1);
                assert_eq!(b.applied_version, 1);
            }
            other => panic!("expected both applied, got {other:?}"),
        }

        assert_eq!(pool.document_count().await, 2);
        assert_eq!(handle_a.snapshot().await.unwrap().unit_len(), 5);
        assert_eq!(handle_b.snapshot().await.unwrap().unit_len(), 10);
    }

    #[tokio::test]
    async fn test_pool_returns_same_handle() {
        let pool = pool();
        let h1 = pool.get_or_create(doc_id()).await.unwrap();
        let h2 = pool.get_or_create(doc_id()).await.unwrap();
        assert_eq!(h1.document_id(), h2.document_id());
        assert_eq!(pool.document_count().await, 1);
        assert!(pool.get(doc_id()).await.is_some());
        assert!(pool.get(Uuid::from_u128(0xFF)).await.is_none());
    }

    #[tokio::test]
    async fn test_state_returns_to_idle() {
        let pool = pool();
        let handle = pool.get_or_create(doc_id()).await.unwrap();
        applied_version(&handle, insert(1, 1, 0, 0, "x")).await;
        assert_eq!(handle.stats().state, CoordinatorState::Idle);
    }
}
