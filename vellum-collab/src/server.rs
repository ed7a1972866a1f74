//! WebSocket sync server routing sessions into per-document coordinators.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── Coordinator (doc_id) ── Document + applied-op log
//! Client B ──┘         │
//!                      ├── BroadcastGroup ──► every session of the doc
//!                      └── persist worker ──► DocumentStore (RocksDB)
//! ```
//!
//! The server owns the transport only: it upgrades connections, decodes
//! envelopes, forwards submissions into the owning coordinator's FIFO queue
//! and pipes the coordinator's confirmation fan-out back down the socket.
//! Conflict resolution never happens here.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coordinator::{CoordinatorConfig, CoordinatorHandle, CoordinatorPool, SubmitOutcome};
use crate::protocol::{MessageType, SessionInfo, SyncMessage};
use crate::storage::{DocumentStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per document
    pub max_sessions_per_document: usize,
    /// Coordinator tuning (queues, persistence cadence)
    pub coordinator: CoordinatorConfig,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            max_sessions_per_document: 100,
            coordinator: CoordinatorConfig::default(),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    pool: Arc<CoordinatorPool>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let store = config.storage_path.as_ref().map(|path| {
            let store_config = StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            };
            Arc::new(DocumentStore::open(store_config).expect("Failed to open document store"))
        });

        let pool = Arc::new(CoordinatorPool::new(config.coordinator.clone(), store));

        Self {
            config,
            pool,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Recover persisted documents into live coordinators.
    pub async fn recover(&self) -> Result<usize, Box<dyn std::error::Error>> {
        Ok(self.pool.recover_all().await?)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let pool = self.pool.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, pool, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        pool: Arc<CoordinatorPool>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection, populated by the Join handshake.
        let mut session: Option<SessionInfo> = None;
        let mut handle: Option<CoordinatorHandle> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    let info = sync_msg.session_info().unwrap_or_else(|_| {
                                        SessionInfo::with_id(sync_msg.client_id, "Anonymous")
                                    });

                                    let doc_handle =
                                        match pool.get_or_create(sync_msg.document_id).await {
                                            Ok(h) => h,
                                            Err(e) => {
                                                log::error!(
                                                    "Cannot open document {}: {e}",
                                                    sync_msg.document_id
                                                );
                                                break;
                                            }
                                        };

                                    if doc_handle.broadcast_group().receiver_count()
                                        >= config.max_sessions_per_document
                                    {
                                        log::warn!(
                                            "Document {} is full, refusing {addr}",
                                            sync_msg.document_id
                                        );
                                        break;
                                    }

                                    // Subscribe before registering so no
                                    // confirmation can slip between the two.
                                    broadcast_rx = Some(doc_handle.subscribe());
                                    if doc_handle.session_opened(info.clone()).await.is_err() {
                                        break;
                                    }

                                    // Ship the current state as the join reply.
                                    if let Ok(snapshot) = doc_handle.snapshot().await {
                                        let reply = SyncMessage::snapshot(&snapshot);
                                        if !send_message(&mut ws_sender, &reply).await {
                                            break;
                                        }
                                    }

                                    {
                                        let mut s = stats.write().await;
                                        s.active_documents = pool.document_count().await;
                                    }

                                    log::info!(
                                        "Session {} ({}) joined doc {} from {addr}",
                                        info.name,
                                        info.client_id,
                                        sync_msg.document_id
                                    );
                                    session = Some(info);
                                    handle = Some(doc_handle);
                                }

                                MessageType::Submit => {
                                    let Some(ref doc_handle) = handle else {
                                        log::warn!("Submit before Join from {addr}");
                                        continue;
                                    };
                                    let op = match sync_msg.operation() {
                                        Ok(op) => op,
                                        Err(e) => {
                                            log::warn!("Undecodable operation from {addr}: {e}");
                                            continue;
                                        }
                                    };

                                    match doc_handle.submit(op).await {
                                        // The broadcast fan-out carries the
                                        // confirmation to everyone, including
                                        // this session.
                                        Ok(SubmitOutcome::Applied(_)) => {}
                                        Ok(SubmitOutcome::AlreadyApplied(confirmed)) => {
                                            let msg = SyncMessage::confirm(
                                                doc_handle.document_id(),
                                                &confirmed,
                                            );
                                            if !send_message(&mut ws_sender, &msg).await {
                                                break;
                                            }
                                        }
                                        Ok(SubmitOutcome::Rejected(rejection)) => {
                                            let msg = SyncMessage::reject(
                                                doc_handle.document_id(),
                                                sync_msg.client_id,
                                                &rejection,
                                            );
                                            if !send_message(&mut ws_sender, &msg).await {
                                                break;
                                            }
                                        }
                                        Ok(SubmitOutcome::Cancelled) => {}
                                        Err(e) => {
                                            log::error!("Coordinator unreachable: {e}");
                                            break;
                                        }
                                    }
                                }

                                MessageType::SnapshotRequest => {
                                    if let Some(ref doc_handle) = handle {
                                        if let Ok(snapshot) = doc_handle.snapshot().await {
                                            let reply = SyncMessage::snapshot(&snapshot);
                                            if !send_message(&mut ws_sender, &reply).await {
                                                break;
                                            }
                                        }
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.client_id);
                                    if !send_message(&mut ws_sender, &pong).await {
                                        break;
                                    }
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing fan-out from the coordinator
                msg = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not joined yet — wait forever.
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Confirmations go to every session, the
                            // submitter included — that is its ack.
                            if ws_sender
                                .send(Message::Binary(data.to_vec().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!(
                                "Session {:?} lagged by {n} messages; a snapshot fetch will resync it",
                                session.as_ref().map(|s| s.client_id)
                            );
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: cancel queued ops first, then close the session.
        if let (Some(info), Some(doc_handle)) = (&session, &handle) {
            doc_handle.cancel_pending(info.client_id);
            let _ = doc_handle.session_closed(info.client_id).await;
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.pool.document_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the coordinator pool.
    pub fn pool(&self) -> &Arc<CoordinatorPool> {
        &self.pool
    }

    /// Shut down all coordinators, flushing persistence.
    pub async fn shutdown(&self) {
        self.pool.shutdown_all().await;
    }
}

/// Encode and send a protocol message. Returns false when the connection is
/// gone and the caller should stop (an encode failure is logged and skipped
/// without killing the connection).
async fn send_message<S>(sink: &mut S, msg: &SyncMessage) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
{
    match msg.encode() {
        Ok(encoded) => sink.send(Message::Binary(encoded.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode outbound message: {e}");
            true
        }
    }
}
