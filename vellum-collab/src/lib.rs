//! # vellum-collab — Synchronization service for collaborative documents
//!
//! Real-time multiplayer editing over WebSockets, built on the operational
//! transformation core in `vellum-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    Binary Proto     │ (transport) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ partitioned by doc_id
//!        ▼                                   ▼
//! ┌─────────────┐                    ┌───────────────┐
//! │ Document    │                    │ Coordinator   │  one task per doc:
//! │ (replica)   │                    │ (authority)   │  validate → rebase →
//! └─────────────┘                    └──────┬────────┘  apply → broadcast
//!                                           │
//!                                  ┌────────┴────────┐
//!                                  ▼                 ▼
//!                           BroadcastGroup     persist worker
//!                           (fan-out)          (WAL + RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`coordinator`] — per-document serialization point and state machine
//! - [`broadcast`] — per-document fan-out with backpressure
//! - [`session`] — ephemeral per-connection session bookkeeping
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with a confirmed-state replica
//! - [`storage`] — RocksDB persistence: snapshots, op log, WAL, compaction

pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use coordinator::{
    CoordinatorConfig, CoordinatorHandle, CoordinatorPool, CoordinatorState, CoordinatorStats,
    SubmitOutcome,
};
pub use protocol::{
    ConfirmedOp, MessageType, ProtocolError, RejectReason, Rejection, SessionInfo, SyncMessage,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{ClientSession, SessionRegistry};
pub use storage::{
    CompressedOp, DocumentMetadata, DocumentStore, OpLog, OpLogStats, StoreConfig, StoreError,
    WalConfig, WalEntry, WalError, WriteAheadLog,
};
