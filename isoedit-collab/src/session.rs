//! Room sessions: the handle an application edits through.
//!
//! A [`RoomHandle`] owns the room's [`MapDocument`] and [`PresenceChannel`]
//! behind short-lived locks. Local edits apply immediately and hand their
//! operations to the connection task over a command channel, so no call on
//! the handle ever waits for the network.
//!
//! ```text
//! app ──► RoomHandle::local_insert ──► MapDocument (applied, undoable)
//!                 │
//!                 └── Command::Send(op) ──► connection task ──► relay
//!
//! relay ──► connection task ──► MapDocument::apply_remote
//!                                     ├── on_remote_op handlers
//!                                     └── watch<Vec<AssetRecord>>
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use isoedit_core::{
    Asset, AssetRecord, CoreError, GridPos, MapDocument, OpId, Operation, PeerId, ReplicaConfig, UndoConfig,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::client::ConnectionState;
use crate::presence::{PresenceChannel, PresenceConfig, PresenceSnapshot};
use crate::protocol::PresenceMessage;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub presence: PresenceConfig,
    pub replica: ReplicaConfig,
    pub undo: UndoConfig,
    /// Failed connection attempts in a row before giving up.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Unsent operations kept while offline.
    pub outbox_capacity: usize,
    /// Maximum operations per `sync-response` this peer sends.
    pub sync_response_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            replica: ReplicaConfig::default(),
            undo: UndoConfig::default(),
            max_retries: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            outbox_capacity: 10_000,
            sync_response_cap: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("disconnected: retries exhausted")]
    Disconnected,
    #[error("session closed")]
    Closed,
}

/// Requests from the handle to the connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Operation),
    PublishPresence(PresenceMessage),
    Reconnect,
    Leave,
}

type OpHandler = Box<dyn Fn(&Operation) + Send + Sync>;
type PresenceHandler = Box<dyn Fn(&PresenceSnapshot) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    ops: RwLock<Vec<OpHandler>>,
    presence: RwLock<Vec<PresenceHandler>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a [`RoomHandle`] and its connection task.
pub(crate) struct RoomShared {
    pub(crate) room_id: String,
    pub(crate) url: String,
    pub(crate) config: SessionConfig,
    pub(crate) doc: Mutex<MapDocument>,
    pub(crate) presence: Mutex<PresenceChannel>,
    assets_tx: watch::Sender<Vec<AssetRecord>>,
    state_tx: watch::Sender<ConnectionState>,
    handlers: Handlers,
}

impl RoomShared {
    pub(crate) fn new(
        room_id: String,
        url: String,
        config: SessionConfig,
        doc: MapDocument,
        presence: PresenceChannel,
    ) -> Self {
        let (assets_tx, _) = watch::channel(doc.snapshot());
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            room_id,
            url,
            config,
            doc: Mutex::new(doc),
            presence: Mutex::new(presence),
            assets_tx,
            state_tx,
            handlers: Handlers::default(),
        }
    }

    /// Publish the document's live records if they changed. Called with the
    /// document lock held so snapshots are published in order.
    pub(crate) fn publish_assets(&self, doc: &MapDocument) {
        let snapshot = doc.snapshot();
        self.assets_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Room {}: {:?} → {:?}", self.room_id, current, state);
            *current = state;
            true
        });
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn notify_remote_op(&self, op: &Operation) {
        let handlers = self.handlers.ops.read().unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler(op);
        }
    }

    pub(crate) fn notify_presence(&self, snapshot: &PresenceSnapshot) {
        let handlers = self.handlers.presence.read().unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler(snapshot);
        }
    }
}

/// A joined room. Dropping the handle leaves the room.
pub struct RoomHandle {
    shared: std::sync::Arc<RoomShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub(crate) fn new(
        shared: std::sync::Arc<RoomShared>,
        cmd_tx: mpsc::UnboundedSender<Command>,
        task: JoinHandle<()>,
    ) -> Self {
        Self { shared, cmd_tx, task }
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    pub fn peer_id(&self) -> PeerId {
        lock(&self.shared.doc).peer_id()
    }

    // ── Local edits ────────────────────────────────────────────────

    /// Run a mutation against the document and ship whatever it produced.
    fn edit<R>(&self, f: impl FnOnce(&mut MapDocument) -> R) -> R {
        let mut doc = lock(&self.shared.doc);
        let result = f(&mut doc);
        for op in doc.drain_outgoing() {
            if self.cmd_tx.send(Command::Send(op)).is_err() {
                log::debug!("Room {}: connection task gone, edit stays local", self.shared.room_id);
            }
        }
        self.shared.publish_assets(&doc);
        result
    }

    pub fn local_insert(&self, asset: Asset) -> OpId {
        self.edit(|doc| doc.local_insert(asset))
    }

    pub fn local_insert_after(&self, after: Option<OpId>, asset: Asset) -> Result<OpId, CoreError> {
        self.edit(|doc| doc.local_insert_after(after, asset))
    }

    pub fn local_delete(&self, id: OpId) -> bool {
        self.edit(|doc| doc.local_delete(id))
    }

    /// Delete the first live record placed at `pos`.
    pub fn remove_at(&self, pos: GridPos) -> Option<AssetRecord> {
        self.edit(|doc| doc.remove_at(pos))
    }

    pub fn move_after(&self, id: OpId, after: Option<OpId>) -> Result<OpId, CoreError> {
        self.edit(|doc| doc.move_after(id, after))
    }

    pub fn replace_all(&self, assets: Vec<Asset>) -> Vec<OpId> {
        self.edit(|doc| doc.replace_all(assets))
    }

    /// Group several edits into one undoable step.
    pub fn transact<R>(&self, f: impl FnOnce(&mut MapDocument) -> R) -> R {
        self.edit(|doc| doc.transact(f))
    }

    pub fn undo(&self) -> bool {
        self.edit(|doc| doc.undo())
    }

    pub fn redo(&self) -> bool {
        self.edit(|doc| doc.redo())
    }

    pub fn stop_capturing(&self) {
        lock(&self.shared.doc).stop_capturing();
    }

    pub fn can_undo(&self) -> bool {
        lock(&self.shared.doc).can_undo()
    }

    pub fn can_redo(&self) -> bool {
        lock(&self.shared.doc).can_redo()
    }

    /// Merge an externally built operation and transmit it.
    pub fn send(&self, op: Operation) -> Result<(), SessionError> {
        {
            let mut doc = lock(&self.shared.doc);
            let result = doc.apply_remote(op.clone());
            if let isoedit_core::ApplyResult::Rejected(anomaly) = result {
                log::warn!("Room {}: not sending rejected operation: {anomaly}", self.shared.room_id);
                return Ok(());
            }
            self.shared.publish_assets(&doc);
            self.cmd_tx.send(Command::Send(op)).map_err(|_| SessionError::Closed)?;
        }
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<AssetRecord> {
        lock(&self.shared.doc).snapshot()
    }

    pub fn export(&self) -> Vec<Asset> {
        lock(&self.shared.doc).export()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.doc).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.shared.doc).is_empty()
    }

    /// Live records, re-published after every change.
    pub fn subscribe_assets(&self) -> watch::Receiver<Vec<AssetRecord>> {
        self.shared.assets_tx.subscribe()
    }

    // ── Presence ───────────────────────────────────────────────────

    pub fn update_cursor(&self, cursor: Option<GridPos>) {
        let (msg, snapshot) = {
            let mut presence = lock(&self.shared.presence);
            let msg = presence.set_cursor(cursor);
            (msg, presence.snapshot())
        };
        self.shared.notify_presence(&snapshot);
        if self.cmd_tx.send(Command::PublishPresence(msg)).is_err() {
            log::debug!("Room {}: connection task gone, cursor stays local", self.shared.room_id);
        }
    }

    pub fn presence(&self) -> PresenceSnapshot {
        lock(&self.shared.presence).snapshot()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<PresenceSnapshot> {
        lock(&self.shared.presence).subscribe()
    }

    // ── Callbacks ──────────────────────────────────────────────────

    /// Called for every operation from another peer that changed or will
    /// change this replica.
    pub fn on_remote_op(&self, handler: impl Fn(&Operation) + Send + Sync + 'static) {
        self.shared
            .handlers
            .ops
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    /// Called with the full presence map whenever it changes.
    pub fn on_presence(&self, handler: impl Fn(&PresenceSnapshot) + Send + Sync + 'static) {
        self.shared
            .handlers
            .presence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    // ── Connection ─────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the first reconciliation finished, or until retries ran out.
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        let mut rx = self.subscribe_state();
        let state = rx
            .wait_for(|state| matches!(state, ConnectionState::Connected | ConnectionState::Disconnected))
            .await
            .map_err(|_| SessionError::Closed)?;
        match *state {
            ConnectionState::Connected => Ok(()),
            _ => Err(SessionError::Disconnected),
        }
    }

    /// Drop the current connection (or leave the disconnected state) and
    /// connect again right away.
    pub fn reconnect(&self) -> Result<(), SessionError> {
        self.cmd_tx.send(Command::Reconnect).map_err(|_| SessionError::Closed)
    }

    /// Leave the room. Queued operations that were never sent are dropped;
    /// they remain in the local document.
    pub async fn leave(self) {
        log::info!("Leaving room {}", self.shared.room_id);
        let _ = self.cmd_tx.send(Command::Leave);
        if let Err(e) = self.task.await {
            log::warn!("Room {}: connection task ended abnormally: {e}", self.shared.room_id);
        }
    }
}
