//! Presence: who is in the room and which grid cell they are pointing at.
//!
//! ## Architecture
//!
//! ```text
//! heartbeat tick / cursor move
//!       │
//!       ▼
//! PresenceChannel::heartbeat() ──► PresenceMessage (full entry, not a delta)
//!       │
//!       ▼   (relay fan-out)
//! remote PresenceChannel::observe()
//!       │
//!       ▼
//! watch::Receiver<PresenceSnapshot>  ──► cursor rendering
//! ```
//!
//! There is no leave message. Every receiver drops an entry on its own once
//! it has not been refreshed for `expiry_threshold`, so peers can briefly
//! disagree about who is online.

use isoedit_core::{GridPos, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::protocol::PresenceMessage;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    /// Entries not refreshed for longer than this are dropped.
    pub expiry_threshold: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            expiry_threshold: Duration::from_secs(3),
        }
    }
}

impl PresenceConfig {
    /// Heartbeat of `interval`, expiring a peer after `missed` silent beats.
    pub fn with_heartbeat(interval: Duration, missed: u32) -> Self {
        Self {
            heartbeat_interval: interval,
            expiry_threshold: interval * missed,
        }
    }
}

/// Display identity shown next to a peer's cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProfile {
    pub name: String,
    /// CSS color string.
    pub color: String,
}

impl PeerProfile {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// Stable `User-NNN` name and vivid HSL color derived from the peer id.
    pub fn for_peer(peer: PeerId) -> Self {
        let hash = peer.as_uuid().as_u128();
        Self {
            name: format!("User-{}", hash % 1000),
            color: format!("hsl({}, 70%, 50%)", hash % 360),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub peer_id: PeerId,
    pub name: String,
    pub color: String,
    pub cursor: Option<GridPos>,
    /// Local receive time; never sent over the wire.
    pub last_seen: Instant,
}

impl PresenceEntry {
    pub fn new(peer_id: PeerId, profile: &PeerProfile, now: Instant) -> Self {
        Self {
            peer_id,
            name: profile.name.clone(),
            color: profile.color.clone(),
            cursor: None,
            last_seen: now,
        }
    }

    pub fn from_message(msg: PresenceMessage, now: Instant) -> Self {
        Self {
            peer_id: msg.peer_id,
            name: msg.name,
            color: msg.color,
            cursor: msg.cursor,
            last_seen: now,
        }
    }

    pub fn to_message(&self) -> PresenceMessage {
        PresenceMessage {
            peer_id: self.peer_id,
            name: self.name.clone(),
            color: self.color.clone(),
            cursor: self.cursor,
        }
    }

    /// Silent for longer than `threshold`. An entry exactly at the threshold
    /// is still alive, so a third beat arriving on time keeps the peer.
    pub fn is_expired(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > threshold
    }
}

/// Everyone currently known in the room, including the local peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSnapshot {
    pub local: Option<PeerId>,
    pub peers: BTreeMap<PeerId, PresenceEntry>,
}

impl PresenceSnapshot {
    /// Peers online, counting ourselves.
    pub fn online_count(&self) -> usize {
        self.peers.len()
    }

    /// Cursors of everyone but ourselves.
    pub fn remote_cursors(&self) -> Vec<(PeerId, &PresenceEntry, GridPos)> {
        self.peers
            .values()
            .filter(|entry| Some(entry.peer_id) != self.local)
            .filter_map(|entry| entry.cursor.map(|cursor| (entry.peer_id, entry, cursor)))
            .collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PresenceEntry> {
        self.peers.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }
}

/// Local view of the room's presence with liveness expiry.
pub struct PresenceChannel {
    local: PresenceEntry,
    remote: HashMap<PeerId, PresenceEntry>,
    config: PresenceConfig,
    snapshot_tx: watch::Sender<PresenceSnapshot>,
}

impl PresenceChannel {
    pub fn new(peer: PeerId, profile: &PeerProfile, config: PresenceConfig) -> Self {
        let local = PresenceEntry::new(peer, profile, Instant::now());
        let (snapshot_tx, _) = watch::channel(PresenceSnapshot::default());
        let channel = Self {
            local,
            remote: HashMap::new(),
            config,
            snapshot_tx,
        };
        channel.notify();
        channel
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn local(&self) -> &PresenceEntry {
        &self.local
    }

    /// Replace the local entry. The peer id always stays ours.
    pub fn publish(&mut self, entry: PresenceEntry) -> PresenceMessage {
        let peer_id = self.local.peer_id;
        self.local = PresenceEntry { peer_id, ..entry };
        self.notify();
        self.local.to_message()
    }

    pub fn set_cursor(&mut self, cursor: Option<GridPos>) -> PresenceMessage {
        self.local.cursor = cursor;
        self.local.last_seen = Instant::now();
        self.notify();
        self.local.to_message()
    }

    /// Refresh the local entry for a periodic re-broadcast.
    pub fn heartbeat(&mut self, now: Instant) -> PresenceMessage {
        self.local.last_seen = now;
        self.local.to_message()
    }

    /// Merge a remote entry. Our own echoes are ignored. Returns `true` when
    /// the peer was not known before.
    pub fn observe(&mut self, msg: PresenceMessage, now: Instant) -> bool {
        if msg.peer_id == self.local.peer_id {
            return false;
        }
        let peer = msg.peer_id;
        let is_new = self.remote.insert(peer, PresenceEntry::from_message(msg, now)).is_none();
        if is_new {
            log::debug!("Presence: peer {peer} appeared");
        } else {
            log::trace!("Presence: refreshed {peer}");
        }
        self.notify();
        is_new
    }

    /// Drop remote entries that missed too many heartbeats.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let threshold = self.config.expiry_threshold;
        let expired: Vec<PeerId> = self
            .remote
            .values()
            .filter(|entry| entry.is_expired(now, threshold))
            .map(|entry| entry.peer_id)
            .collect();
        for peer in &expired {
            self.remote.remove(peer);
            log::debug!("Presence: peer {peer} timed out");
        }
        if !expired.is_empty() {
            self.notify();
        }
        expired
    }

    /// Forget every remote peer (used when leaving the room).
    pub fn clear_remote(&mut self) {
        self.remote.clear();
        self.notify();
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut peers: BTreeMap<PeerId, PresenceEntry> =
            self.remote.iter().map(|(peer, entry)| (*peer, entry.clone())).collect();
        peers.insert(self.local.peer_id, self.local.clone());
        PresenceSnapshot {
            local: Some(self.local.peer_id),
            peers,
        }
    }

    /// Snapshots of the room's presence; the receiver always starts at the
    /// current state and can be re-created at any time.
    pub fn subscribe(&self) -> watch::Receiver<PresenceSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn notify(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}
