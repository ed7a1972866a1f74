//! WebSocket sync client.
//!
//! Maintains a confirmed-state replica of one document: every edit is
//! submitted to the server with the replica's version as its base, and the
//! replica advances only on confirmed operations from the fan-out — your own
//! confirmation is your acknowledgment. A version gap or a rejection
//! triggers an automatic snapshot fetch to resynchronize.
//!
//! Offline editing is out of scope: submitting while disconnected is an
//! error, not a queued edit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use vellum_core::{
    Document, ElementKind, ElementPayload, Operation, OperationId,
};

use crate::protocol::{
    ConfirmedOp, MessageType, ProtocolError, Rejection, SessionInfo, SyncMessage,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and joined the document
    Connected,
    /// Connection lost
    Disconnected,
    /// A confirmed operation was applied to the replica.
    /// `own` is true when it acknowledges one of ours.
    Confirmed { confirmed: ConfirmedOp, own: bool },
    /// The server rejected one of our operations
    Rejected(Rejection),
    /// The replica was replaced by a server snapshot
    SnapshotLoaded { version: u64 },
    /// Another session joined the document
    SessionJoined(SessionInfo),
    /// A session left the document
    SessionLeft(Uuid),
}

/// The sync client.
pub struct SyncClient {
    info: SessionInfo,
    document_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    /// Confirmed-state replica; advances only on Confirm/Snapshot.
    replica: Arc<RwLock<Document>>,
    /// Monotonic per-client operation sequence
    next_seq: AtomicU64,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(info: SessionInfo, document_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            info,
            document_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(RwLock::new(Document::new(document_id))),
            next_seq: AtomicU64::new(0),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the document.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let ws_stream = match ws_result {
            Ok((ws_stream, _)) => ws_stream,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (ws_writer, mut ws_reader) = futures_util::StreamExt::split(ws_stream);

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());
        let writer = Arc::new(tokio::sync::Mutex::new(ws_writer));
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                let mut w = writer.lock().await;
                use futures_util::SinkExt;
                if w.send(msg).await.is_err() || is_close {
                    break;
                }
            }
        });

        // Join handshake; the server replies with the current snapshot.
        let join = SyncMessage::join(&self.info, self.document_id);
        let encoded = join.encode()?;
        out_tx
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: apply confirmations to the replica, emit events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        let client_id = self.info.client_id;
        let document_id = self.document_id;
        let resync_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(_) => continue,
                        };

                        match sync_msg.msg_type {
                            MessageType::Confirm => {
                                let Ok(confirmed) = sync_msg.confirmed() else { continue };
                                let own = confirmed.op.client_id() == client_id;

                                let in_sync = {
                                    let mut doc = replica.write().await;
                                    if confirmed.applied_version == doc.version() + 1 {
                                        doc.apply(confirmed.op.clone());
                                        true
                                    } else {
                                        false
                                    }
                                };

                                if in_sync {
                                    let _ = event_tx
                                        .send(SyncEvent::Confirmed { confirmed, own })
                                        .await;
                                } else {
                                    // Version gap (e.g. we lagged the
                                    // fan-out): fall back to a snapshot.
                                    log::warn!(
                                        "Version gap on doc {document_id}, requesting snapshot"
                                    );
                                    let req =
                                        SyncMessage::snapshot_request(client_id, document_id);
                                    if let Ok(encoded) = req.encode() {
                                        let _ = resync_tx.send(Message::Binary(encoded.into())).await;
                                    }
                                }
                            }

                            MessageType::Snapshot => {
                                let Ok(snapshot) = sync_msg.document_snapshot() else {
                                    continue;
                                };
                                let version = snapshot.version;
                                {
                                    let mut doc = replica.write().await;
                                    *doc = Document::restore(
                                        snapshot.document_id,
                                        snapshot.version,
                                        snapshot.segments,
                                    );
                                }
                                let _ =
                                    event_tx.send(SyncEvent::SnapshotLoaded { version }).await;
                            }

                            MessageType::Reject => {
                                let Ok(rejection) = sync_msg.rejection() else { continue };
                                // Version disputes are resolved by fetching
                                // the authoritative state.
                                let needs_resync = !matches!(
                                    rejection.reason,
                                    crate::protocol::RejectReason::Malformed(_)
                                );
                                let _ = event_tx.send(SyncEvent::Rejected(rejection)).await;
                                if needs_resync {
                                    let req =
                                        SyncMessage::snapshot_request(client_id, document_id);
                                    if let Ok(encoded) = req.encode() {
                                        let _ = resync_tx.send(Message::Binary(encoded.into())).await;
                                    }
                                }
                            }

                            MessageType::SessionJoined => {
                                if let Ok(info) = sync_msg.session_info() {
                                    if info.client_id != client_id {
                                        let _ =
                                            event_tx.send(SyncEvent::SessionJoined(info)).await;
                                    }
                                }
                            }

                            MessageType::SessionLeft => {
                                let _ = event_tx
                                    .send(SyncEvent::SessionLeft(sync_msg.client_id))
                                    .await;
                            }

                            _ => {}
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit a text insert at `position` (replica coordinates).
    pub async fn submit_insert(
        &self,
        position: u64,
        payload: ElementPayload,
    ) -> Result<OperationId, ProtocolError> {
        let (base_version, seq) = self.next_op().await?;
        let op = Operation::insert(
            self.document_id,
            self.info.client_id,
            seq,
            base_version,
            position,
            payload,
            now_millis(),
        );
        self.send_op(&op).await?;
        Ok(op.id)
    }

    /// Submit a delete of `length` units starting at `position`.
    pub async fn submit_delete(
        &self,
        position: u64,
        length: u64,
    ) -> Result<OperationId, ProtocolError> {
        let (base_version, seq) = self.next_op().await?;
        let op = Operation::delete(
            self.document_id,
            self.info.client_id,
            seq,
            base_version,
            position,
            length,
            ElementKind::Text,
            now_millis(),
        );
        self.send_op(&op).await?;
        Ok(op.id)
    }

    /// Submit a single-unit replacement at `position`.
    pub async fn submit_update(
        &self,
        position: u64,
        payload: ElementPayload,
    ) -> Result<OperationId, ProtocolError> {
        let (base_version, seq) = self.next_op().await?;
        let op = Operation::update(
            self.document_id,
            self.info.client_id,
            seq,
            base_version,
            position,
            payload,
            now_millis(),
        );
        self.send_op(&op).await?;
        Ok(op.id)
    }

    /// Request a full snapshot (manual resync).
    pub async fn request_snapshot(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::snapshot_request(self.info.client_id, self.document_id);
        self.send_bytes(msg.encode()?).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.info.client_id);
        self.send_bytes(msg.encode()?).await
    }

    async fn next_op(&self) -> Result<(u64, u64), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            // No offline queue by design: the edit is refused outright.
            return Err(ProtocolError::ConnectionClosed);
        }
        let base_version = self.replica.read().await.version();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((base_version, seq))
    }

    async fn send_op(&self, op: &Operation) -> Result<(), ProtocolError> {
        self.send_bytes(SyncMessage::submit(op).encode()?).await
    }

    async fn send_bytes(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. Any operation not yet handed to the server is
    /// dropped — a disconnect cancels unacknowledged work by design.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current confirmed replica version.
    pub async fn replica_version(&self) -> u64 {
        self.replica.read().await.version()
    }

    /// Materialized replica segments (confirmed state only).
    pub async fn replica_segments(&self) -> Vec<vellum_core::Segment> {
        self.replica.read().await.segments().to_vec()
    }

    /// Get our session info.
    pub fn session_info(&self) -> &SessionInfo {
        &self.info
    }

    /// Get the document ID.
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
