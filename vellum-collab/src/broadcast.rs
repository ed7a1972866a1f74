//! Fan-out of confirmed operations to every session of a document.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! session gets an independent receiver buffering up to `capacity` messages;
//! a session that falls further behind starts dropping (backpressure) and is
//! told how far it lagged, at which point a snapshot fetch resynchronizes it.
//!
//! Confirmations are delivered to *every* session, including the submitter —
//! receiving your own confirmation is the acknowledgment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub receivers_at_last_send: u64,
}

/// Lock-free counters, updated on the hot path without any lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    receivers_at_last_send: AtomicU64,
}

/// The fan-out channel for a single document.
///
/// Owned (behind `Arc`) by the document's coordinator; the server subscribes
/// one receiver per connected session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                receivers_at_last_send: AtomicU64::new(0),
            },
        }
    }

    /// Subscribe a new receiver (one per connected session).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Encode and fan out a protocol message.
    ///
    /// Returns the number of receivers that got it. Zero receivers is not an
    /// error: a document can be mutated while nobody is connected.
    pub fn send(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.send_raw(Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes (zero-copy fast path). Fully lock-free.
    pub fn send_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .receivers_at_last_send
            .store(count as u64, Ordering::Relaxed);
        count
    }

    /// Number of currently subscribed receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-receiver buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            receivers_at_last_send: self.stats.receivers_at_last_send.load(Ordering::Relaxed),
        }
    }
}
