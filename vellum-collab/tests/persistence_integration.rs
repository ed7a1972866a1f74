//! Persistence integration tests.
//!
//! Verifies:
//! - Confirmed operations reach the store through the persist worker
//! - Snapshot compaction trims the durable op log
//! - A restarted pool recovers documents from snapshot + op tail
//! - WAL entries survive and checksum-verify
//! - Multi-document isolation under persistence

use std::sync::Arc;

use tempfile::tempdir;
use uuid::Uuid;

use vellum_collab::coordinator::{CoordinatorConfig, CoordinatorPool, SubmitOutcome};
use vellum_collab::storage::{DocumentStore, StoreConfig, WriteAheadLog};
use vellum_collab::SyncServer;
use vellum_core::{DocumentRenderer, ElementPayload, Operation, PlainTextRenderer};

fn client(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn open_store(path: &std::path::Path) -> Arc<DocumentStore> {
    Arc::new(DocumentStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn insert(doc: Uuid, seq: u64, base: u64, position: u64, text: &str) -> Operation {
    Operation::insert(
        doc,
        client(1),
        seq,
        base,
        position,
        ElementPayload::Text(text.into()),
        1000 + seq,
    )
}

async fn submit_ok(
    pool: &CoordinatorPool,
    op: Operation,
) -> u64 {
    let handle = pool.get_or_create(op.document_id).await.unwrap();
    match handle.submit(op).await.unwrap() {
        SubmitOutcome::Applied(c) => c.applied_version,
        other => panic!("expected Applied, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ops_persist_through_worker() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store.clone()));
    let doc = Uuid::new_v4();

    submit_ok(&pool, insert(doc, 1, 0, 0, "durable")).await;
    submit_ok(&pool, insert(doc, 2, 1, 7, " state")).await;
    pool.shutdown_all().await;

    // Shutdown compacts: a snapshot at the head version exists.
    let (snapshot_version, content) = store.load_snapshot(doc).unwrap();
    assert_eq!(snapshot_version, 2);
    let segments = vellum_collab::storage::decode_segments(&content).unwrap();
    assert_eq!(PlainTextRenderer.render(&segments), "durable state");
}

#[tokio::test]
async fn test_restart_recovers_document() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    {
        let store = open_store(&path);
        let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store));
        submit_ok(&pool, insert(doc, 1, 0, 0, "hello")).await;
        submit_ok(&pool, insert(doc, 2, 1, 5, " again")).await;
        pool.shutdown_all().await;
    }

    // Fresh store + pool over the same directory: state must come back.
    let store = open_store(&path);
    let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store));
    let recovered = pool.recover_all().await.unwrap();
    assert_eq!(recovered, 1);

    let handle = pool.get_or_create(doc).await.unwrap();
    let snap = handle.snapshot().await.unwrap();
    assert_eq!(snap.version, 2);
    assert_eq!(PlainTextRenderer.render(&snap.segments), "hello again");

    // And the recovered document accepts new edits on top.
    let v3 = submit_ok(&pool, insert(doc, 3, 2, 11, "!")).await;
    assert_eq!(v3, 3);
}

#[tokio::test]
async fn test_recovery_replays_op_tail_beyond_snapshot() {
    // A crash can leave a snapshot plus a newer op tail behind. Build that
    // store state directly, then verify a fresh pool replays the tail.
    use vellum_collab::protocol::ConfirmedOp;
    use vellum_collab::storage::encode_segments;
    use vellum_core::{Document, ResolvedOp};

    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    {
        let store = open_store(&path);

        // Snapshot at version 1: "ab".
        let mut base = Document::new(doc);
        base.apply(ResolvedOp::from_operation(&insert(doc, 1, 0, 0, "ab")));
        let content = encode_segments(base.segments()).unwrap();
        store.save_snapshot(doc, 1, &content).unwrap();

        // Op tail: versions 2 and 3, never compacted into the snapshot.
        for (seq, position, text) in [(2u64, 2u64, "cd"), (3, 4, "ef")] {
            let confirmed = ConfirmedOp {
                applied_version: seq,
                op: ResolvedOp::from_operation(&insert(doc, seq, seq - 1, position, text)),
            };
            store.store_op(doc, seq, &confirmed.encode().unwrap()).unwrap();
        }
    }

    let store = open_store(&path);
    let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store));
    let handle = pool.get_or_create(doc).await.unwrap();
    let snap = handle.snapshot().await.unwrap();
    assert_eq!(snap.version, 3);
    assert_eq!(PlainTextRenderer.render(&snap.segments), "abcdef");

    // Stale ops based before the recovered log floor need a resync.
    match handle.submit(insert(doc, 9, 0, 0, "late")).await.unwrap() {
        SubmitOutcome::Rejected(r) => assert!(matches!(
            r.reason,
            vellum_collab::protocol::RejectReason::ResyncRequired { base_version: 0, log_start: 1 }
        )),
        other => panic!("expected Rejected, got {other:?}"),
    }
    pool.shutdown_all().await;
}

#[tokio::test]
async fn test_compaction_trims_durable_op_log() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store.clone()));
    let doc = Uuid::new_v4();

    let mut position = 0;
    for seq in 1..=8u64 {
        submit_ok(&pool, insert(doc, seq, seq - 1, position, "x")).await;
        position += 1;
    }
    pool.shutdown_all().await;

    // Everything up to the final snapshot version is compacted away.
    let meta = store.load_metadata(doc).unwrap();
    assert_eq!(meta.snapshot_version, 8);
    assert!(store.load_ops_since(doc, 1).unwrap().is_empty());
}

#[tokio::test]
async fn test_wal_flushes_ahead_of_compaction() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let doc = Uuid::new_v4();

    // Compaction far away, tiny WAL buffer: entries must reach the store's
    // WAL column family while ops are still in flight.
    let pool = CoordinatorPool::new(
        CoordinatorConfig {
            compaction_threshold: 1000,
            ..CoordinatorConfig::for_testing()
        },
        Some(store.clone()),
    );

    let mut position = 0;
    for seq in 1..=12u64 {
        submit_ok(&pool, insert(doc, seq, seq - 1, position, "walled ")).await;
        position += 7;
    }
    // Let the persist worker drain its queue.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let raw = store.wal_read_since(0).unwrap();
    assert!(!raw.is_empty(), "the WAL buffer must have flushed mid-run");

    let (entries, corrupted) = WriteAheadLog::recover_entries(&raw);
    assert_eq!(corrupted, 0);
    assert!(entries.iter().any(|e| e.document_id == doc && e.version == 1));

    // A clean shutdown compacts, checkpoints, and truncates the WAL.
    pool.shutdown_all().await;
    assert!(store.wal_read_since(0).unwrap().is_empty());
}

#[tokio::test]
async fn test_multi_document_isolation_under_persistence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    {
        let store = open_store(&path);
        let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store));
        submit_ok(&pool, insert(doc_a, 1, 0, 0, "alpha")).await;
        submit_ok(&pool, insert(doc_b, 1, 0, 0, "beta")).await;
        pool.shutdown_all().await;
    }

    let store = open_store(&path);
    let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store));
    assert_eq!(pool.recover_all().await.unwrap(), 2);

    let snap_a = pool.get_or_create(doc_a).await.unwrap().snapshot().await.unwrap();
    let snap_b = pool.get_or_create(doc_b).await.unwrap().snapshot().await.unwrap();
    assert_eq!(PlainTextRenderer.render(&snap_a.segments), "alpha");
    assert_eq!(PlainTextRenderer.render(&snap_b.segments), "beta");
}

#[tokio::test]
async fn test_durability_not_degraded_in_normal_flow() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store));
    let doc = Uuid::new_v4();

    let handle = pool.get_or_create(doc).await.unwrap();
    submit_ok(&pool, insert(doc, 1, 0, 0, "fine")).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert!(!handle.stats().degraded_durability);
    pool.shutdown_all().await;
}

#[tokio::test]
async fn test_server_level_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    {
        let store = open_store(&path);
        let pool = CoordinatorPool::new(CoordinatorConfig::for_testing(), Some(store));
        submit_ok(&pool, insert(doc, 1, 0, 0, "served")).await;
        pool.shutdown_all().await;
    }

    let server = SyncServer::with_storage("127.0.0.1:0", &path);
    let recovered = server.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let handle = server.pool().get(doc).await.unwrap();
    let snap = handle.snapshot().await.unwrap();
    assert_eq!(PlainTextRenderer.render(&snap.segments), "served");
    server.shutdown().await;
}
