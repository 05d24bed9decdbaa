//! Fan-out of relay frames to every other connection in a room.
//!
//! Uses a tokio broadcast channel so one send reaches all subscribers. Each
//! connection has its own receiver buffering up to `capacity` frames; a
//! connection that falls further behind loses the oldest frames (backpressure)
//! and the relay answers the lag by resending the room's op log.
//!
//! Reference: Patterson & Hennessy, Section 6.4: Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, WireMessage};

/// Relay-local identity of one websocket connection.
pub type ConnectionId = u64;

/// An encoded frame plus the connection it came from, so it is not echoed.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub origin: ConnectionId,
    pub text: Arc<str>,
}

/// Fan-out counters of one group.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RelayFrame>,
    members: RwLock<HashSet<ConnectionId>>,
    /// Latest presence frame per connection, replayed to new members.
    presence: RwLock<HashMap<ConnectionId, Arc<str>>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group whose channel holds `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            presence: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_member(&self, conn: ConnectionId) -> broadcast::Receiver<RelayFrame> {
        self.members.write().await.insert(conn);
        self.sender.subscribe()
    }

    /// Unregister a connection and forget its presence frame.
    pub async fn remove_member(&self, conn: ConnectionId) -> bool {
        self.presence.write().await.remove(&conn);
        self.members.write().await.remove(&conn)
    }

    /// Encode and send a message to all members. Returns the receiver count.
    pub fn broadcast(&self, origin: ConnectionId, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let text = msg.encode()?;
        Ok(self.broadcast_raw(origin, Arc::from(text)))
    }

    /// Send an already-encoded frame as is.
    pub fn broadcast_raw(&self, origin: ConnectionId, text: Arc<str>) -> usize {
        let count = self.sender.send(RelayFrame { origin, text }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Keep `text` as the latest presence frame of `conn`.
    pub async fn remember_presence(&self, conn: ConnectionId, text: Arc<str>) {
        self.presence.write().await.insert(conn, text);
    }

    /// Presence frames of every member except `conn`.
    pub async fn presence_frames(&self, conn: ConnectionId) -> Vec<Arc<str>> {
        self.presence
            .read()
            .await
            .iter()
            .filter(|(member, _)| **member != conn)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Count frames a lagging member skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Get the current member count.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether `conn` is registered.
    pub async fn has_member(&self, conn: ConnectionId) -> bool {
        self.members.read().await.contains(&conn)
    }

    /// Get the fan-out counters.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
