//! Binary wire protocol for operation synchronization.
//!
//! Envelope format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬─────────────┬──────────┐
//! │ msg_type │ client_id │ document_id │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes    │ variable │
//! └──────────┴───────────┴─────────────┴──────────┘
//! ```
//!
//! The payload is itself bincode: an [`Operation`] for `Submit`, a
//! [`ConfirmedOp`] for `Confirm`, and so on. The coordinator only requires
//! FIFO delivery per document; everything about causal order lives in the
//! operations themselves (`base_version`), never in arrival order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vellum_core::{DocumentSnapshot, MalformedOperation, Operation, OperationId, ResolvedOp};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client joins a document (first message on a connection)
    Join = 1,
    /// Client submits an operation
    Submit = 2,
    /// Server confirms an applied operation (fan-out to all sessions)
    Confirm = 3,
    /// Server rejects an operation (sent to the submitter only)
    Reject = 4,
    /// Client requests a full snapshot (resync)
    SnapshotRequest = 5,
    /// Server ships the current snapshot
    Snapshot = 6,
    /// A session joined the document
    SessionJoined = 7,
    /// A session left the document
    SessionLeft = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Session identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub client_id: Uuid,
    pub name: String,
}

impl SessionInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with an explicit client id (for testing and reconnects).
    pub fn with_id(client_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            client_id,
            name: name.into(),
        }
    }
}

/// An applied operation as broadcast to every session of the document.
///
/// Carries the post-transform position(s) and the version the apply
/// produced; receiving your own `ConfirmedOp` is the acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedOp {
    pub applied_version: u64,
    pub op: ResolvedOp,
}

impl ConfirmedOp {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (op, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(op)
    }
}

/// Why an operation was rejected. Local to the offending operation — other
/// operations on the same document are never blocked or rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Construction-time validation failure.
    Malformed(MalformedOperation),
    /// The client claims a base version the server has not reached —
    /// a protocol violation; resynchronize via a snapshot fetch.
    VersionAhead { base_version: u64, server_version: u64 },
    /// The base version predates the in-memory log floor (server restarted
    /// since); resynchronize via a snapshot fetch.
    ResyncRequired { base_version: u64, log_start: u64 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Malformed(m) => write!(f, "Malformed operation: {m}"),
            RejectReason::VersionAhead { base_version, server_version } => write!(
                f,
                "Base version {base_version} ahead of server version {server_version}"
            ),
            RejectReason::ResyncRequired { base_version, log_start } => write!(
                f,
                "Base version {base_version} predates log start {log_start}, resync required"
            ),
        }
    }
}

/// A rejection notice for a single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub op_id: OperationId,
    pub reason: RejectReason,
    pub server_version: u64,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead; a typical `Confirm` is the
/// 33-byte envelope plus the resolved operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub client_id: Uuid,
    pub document_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a join message (first message on a connection).
    pub fn join(info: &SessionInfo, document_id: Uuid) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Join,
            client_id: info.client_id,
            document_id,
            payload,
        }
    }

    /// Create a submit message carrying a client operation.
    pub fn submit(op: &Operation) -> Self {
        let payload = bincode::serde::encode_to_vec(op, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Submit,
            client_id: op.client_id(),
            document_id: op.document_id,
            payload,
        }
    }

    /// Create a confirmation broadcast for an applied operation.
    pub fn confirm(document_id: Uuid, confirmed: &ConfirmedOp) -> Self {
        let payload = bincode::serde::encode_to_vec(confirmed, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Confirm,
            client_id: confirmed.op.client_id(),
            document_id,
            payload,
        }
    }

    /// Create a rejection notice for the submitter.
    pub fn reject(document_id: Uuid, client_id: Uuid, rejection: &Rejection) -> Self {
        let payload = bincode::serde::encode_to_vec(rejection, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Reject,
            client_id,
            document_id,
            payload,
        }
    }

    /// Create a snapshot request (client-initiated resync).
    pub fn snapshot_request(client_id: Uuid, document_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::SnapshotRequest,
            client_id,
            document_id,
            payload: Vec::new(),
        }
    }

    /// Create a snapshot response carrying the full materialized state.
    pub fn snapshot(snapshot: &DocumentSnapshot) -> Self {
        let payload = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Snapshot,
            client_id: Uuid::nil(),
            document_id: snapshot.document_id,
            payload,
        }
    }

    /// Create a session-joined notification.
    pub fn session_joined(info: &SessionInfo, document_id: Uuid) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::SessionJoined,
            client_id: info.client_id,
            document_id,
            payload,
        }
    }

    /// Create a session-left notification.
    pub fn session_left(client_id: Uuid, document_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::SessionLeft,
            client_id,
            document_id,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            client_id,
            document_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            client_id,
            document_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a `Submit` payload.
    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        if self.msg_type != MessageType::Submit {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (op, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(op)
    }

    /// Parse a `Confirm` payload.
    pub fn confirmed(&self) -> Result<ConfirmedOp, ProtocolError> {
        if self.msg_type != MessageType::Confirm {
            return Err(ProtocolError::InvalidMessageType);
        }
        ConfirmedOp::decode(&self.payload)
    }

    /// Parse a `Reject` payload.
    pub fn rejection(&self) -> Result<Rejection, ProtocolError> {
        if self.msg_type != MessageType::Reject {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (rejection, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(rejection)
    }

    /// Parse a `Snapshot` payload.
    pub fn document_snapshot(&self) -> Result<DocumentSnapshot, ProtocolError> {
        if self.msg_type != MessageType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(snapshot)
    }

    /// Parse a `Join` / `SessionJoined` payload.
    pub fn session_info(&self) -> Result<SessionInfo, ProtocolError> {
        if self.msg_type != MessageType::Join && self.msg_type != MessageType::SessionJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
