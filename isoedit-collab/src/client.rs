//! WebSocket sync client: one connection task per joined room.
//!
//! Provides:
//! - Connection lifecycle (connect, reconcile, reconnect with backoff)
//! - Operation send/receive merged into the room's `MapDocument`
//! - Presence heartbeats and local expiry
//! - Outbox for edits made while disconnected
//!
//! Reconnection: each failed attempt doubles the wait up to `max_backoff`.
//! After `max_retries` failures in a row the room is `Disconnected` and stays
//! there until [`RoomHandle::reconnect`]; local editing keeps working.
//!
//! Reference: Kleppmann, Chapter 5: Replication

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use isoedit_core::{Asset, MapDocument, OpId, Operation, PeerId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::presence::{PeerProfile, PresenceChannel};
use crate::protocol::WireMessage;
use crate::session::{lock, Command, RoomHandle, RoomShared, SessionConfig, SessionError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Reconciliation finished; streaming.
    Connected,
    Reconnecting {
        attempt: u32,
    },
    /// Retries exhausted. Terminal until `reconnect()`.
    Disconnected,
}

/// Operations made while offline, replayed on the next connection.
///
/// Bounded: when full the oldest queued operation is dropped. It stays in the
/// local document and is re-sent after reconciliation if the relay lacks it.
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<Operation>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, op: Operation) {
        if self.queue.len() >= self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                self.dropped += 1;
                log::warn!("Outbox full, dropping queued operation {}", oldest.id());
            }
        }
        self.queue.push_back(op);
    }

    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Operations lost to the capacity bound so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Entry point for joining rooms on a relay.
#[derive(Debug, Clone)]
pub struct SyncClient {
    server_url: String,
    peer_id: PeerId,
    profile: PeerProfile,
    config: SessionConfig,
}

impl SyncClient {
    /// `server_url` is the relay base, e.g. `ws://127.0.0.1:9090`; rooms are
    /// addressed as `<server_url>/<room>`.
    pub fn new(server_url: impl Into<String>, config: SessionConfig) -> Self {
        let peer_id = PeerId::new();
        Self {
            server_url: server_url.into(),
            peer_id,
            profile: PeerProfile::for_peer(peer_id),
            config,
        }
    }

    pub fn with_identity(mut self, peer_id: PeerId, profile: PeerProfile) -> Self {
        self.peer_id = peer_id;
        self.profile = profile;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn profile(&self) -> &PeerProfile {
        &self.profile
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Join a room. Must be called inside a tokio runtime; returns at once and
    /// connects in the background.
    pub fn join(&self, room_id: impl Into<String>) -> RoomHandle {
        self.join_inner(room_id.into(), None)
    }

    /// Join a room and seed it with `assets` once the first reconciliation
    /// shows the room is still empty.
    pub fn join_with_assets(&self, room_id: impl Into<String>, assets: Vec<Asset>) -> RoomHandle {
        self.join_inner(room_id.into(), Some(assets))
    }

    fn join_inner(&self, room_id: String, initial: Option<Vec<Asset>>) -> RoomHandle {
        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), room_id);
        let doc = MapDocument::new(self.peer_id, self.config.replica.clone(), self.config.undo.clone());
        let presence = PresenceChannel::new(self.peer_id, &self.profile, self.config.presence.clone());
        let shared = Arc::new(RoomShared::new(room_id, url, self.config.clone(), doc, presence));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            outbox: Outbox::new(self.config.outbox_capacity),
            shared: shared.clone(),
            cmd_rx,
            initial,
        };
        let handle = tokio::spawn(task.run());
        RoomHandle::new(shared, cmd_tx, handle)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// How a connection (or a stretch of being offline) ended.
enum Exit {
    Leave,
    Reconnect,
    Dropped { synced: bool },
}

/// Reconciliation bookkeeping for one connection.
#[derive(Default)]
struct SyncProgress {
    done: bool,
    /// Ids the relay returned in its sync-response.
    received: HashSet<OpId>,
    /// Our ids streamed after the sync-request went out.
    sent: HashSet<OpId>,
}

struct ConnectionTask {
    shared: Arc<RoomShared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    outbox: Outbox,
    initial: Option<Vec<Asset>>,
}

impl ConnectionTask {
    /// Main connection loop with automatic reconnection.
    async fn run(mut self) {
        let config = self.shared.config.clone();
        let mut attempt: u32 = 0;
        let mut backoff = config.initial_backoff;
        log::info!("Starting session for room {} at {}", self.shared.room_id, self.shared.url);

        loop {
            self.shared.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            match self.connect_once().await {
                Ok(Exit::Leave) => break,
                Ok(Exit::Reconnect) => {
                    attempt = 0;
                    backoff = config.initial_backoff;
                    continue;
                }
                Ok(Exit::Dropped { synced }) => {
                    log::warn!("Connection to {} dropped", self.shared.url);
                    if synced {
                        attempt = 0;
                        backoff = config.initial_backoff;
                    }
                }
                Err(e) => log::error!("Connection to {} failed: {e}", self.shared.url),
            }

            attempt += 1;
            if attempt > config.max_retries {
                log::warn!(
                    "Room {}: giving up after {} attempts, working offline",
                    self.shared.room_id,
                    config.max_retries
                );
                self.shared.set_state(ConnectionState::Disconnected);
                match self.offline(None).await {
                    Exit::Leave => break,
                    _ => {
                        attempt = 0;
                        backoff = config.initial_backoff;
                        continue;
                    }
                }
            }

            self.shared.set_state(ConnectionState::Reconnecting { attempt });
            log::info!("Retrying {} in {:?}", self.shared.url, backoff);
            match self.offline(Some(time::Instant::now() + backoff)).await {
                Exit::Leave => break,
                Exit::Reconnect => {
                    attempt = 0;
                    backoff = config.initial_backoff;
                }
                Exit::Dropped { .. } => backoff = (backoff * 2).min(config.max_backoff),
            }
        }

        self.outbox.clear();
        lock(&self.shared.presence).clear_remote();
        self.shared.set_state(ConnectionState::Disconnected);
        log::info!("Session for room {} ended", self.shared.room_id);
    }

    /// Handle commands while there is no connection. Returns `Dropped` when
    /// `deadline` passes.
    async fn offline(&mut self, deadline: Option<time::Instant>) -> Exit {
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    if let Some(exit) = self.queue_offline(cmd) {
                        return exit;
                    }
                }
                _ = async {
                    match deadline {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => return Exit::Dropped { synced: false },
                _ = ticker.tick() => self.expire(),
            }
        }
    }

    fn queue_offline(&mut self, cmd: Option<Command>) -> Option<Exit> {
        match cmd {
            Some(Command::Send(op)) => {
                self.outbox.push(op);
                None
            }
            // The local entry already holds the change; the next heartbeat carries it.
            Some(Command::PublishPresence(_)) => None,
            Some(Command::Reconnect) => Some(Exit::Reconnect),
            Some(Command::Leave) | None => Some(Exit::Leave),
        }
    }

    fn ticker(&self) -> time::Interval {
        let period = self.shared.config.presence.heartbeat_interval;
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Attempt a single connection.
    async fn connect_once(&mut self) -> Result<Exit, SessionError> {
        log::info!("Attempting to connect to {}", self.shared.url);
        let url = self.shared.url.clone();
        let connect = tokio_tungstenite::connect_async(url.as_str());
        tokio::pin!(connect);

        let ws_stream = loop {
            tokio::select! {
                result = &mut connect => {
                    let (ws_stream, _) = result.map_err(|e| SessionError::Transport(e.to_string()))?;
                    break ws_stream;
                }
                cmd = self.cmd_rx.recv() => {
                    if let Some(exit) = self.queue_offline(cmd) {
                        return Ok(exit);
                    }
                }
            }
        };
        log::info!("WebSocket handshake completed with {url}");

        let (mut sink, mut stream) = ws_stream.split();
        let mut sync = SyncProgress::default();

        // Replay offline edits before asking for the room state, so the
        // sync-response already accounts for them.
        let queued = self.outbox.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
        }
        for (i, op) in queued.iter().enumerate() {
            if let Err(e) = send_frame(&mut sink, &WireMessage::op(op)).await {
                for op in &queued[i..] {
                    self.outbox.push(op.clone());
                }
                return Err(e);
            }
        }

        send_frame(&mut sink, &WireMessage::SyncRequest).await?;
        let heartbeat = lock(&self.shared.presence).heartbeat(Instant::now());
        send_frame(&mut sink, &WireMessage::Presence(heartbeat)).await?;

        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send(op)) => {
                            if !sync.done {
                                sync.sent.insert(op.id());
                            }
                            if send_frame(&mut sink, &WireMessage::op(&op)).await.is_err() {
                                self.outbox.push(op);
                                return Ok(Exit::Dropped { synced: sync.done });
                            }
                        }
                        Some(Command::PublishPresence(msg)) => {
                            if send_frame(&mut sink, &WireMessage::Presence(msg)).await.is_err() {
                                return Ok(Exit::Dropped { synced: sync.done });
                            }
                        }
                        Some(Command::Reconnect) => {
                            log::info!("Reconnect requested for room {}", self.shared.room_id);
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(Exit::Reconnect);
                        }
                        Some(Command::Leave) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(Exit::Leave);
                        }
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_frame(text.as_str(), &mut sink, &mut sync).await.is_err() {
                                return Ok(Exit::Dropped { synced: sync.done });
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return Ok(Exit::Dropped { synced: sync.done });
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(Exit::Dropped { synced: sync.done });
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error in room {}: {e}", self.shared.room_id);
                            return Ok(Exit::Dropped { synced: sync.done });
                        }
                        _ => {}
                    }
                }

                _ = ticker.tick() => {
                    let heartbeat = lock(&self.shared.presence).heartbeat(Instant::now());
                    if send_frame(&mut sink, &WireMessage::Presence(heartbeat)).await.is_err() {
                        return Ok(Exit::Dropped { synced: sync.done });
                    }
                    self.expire();
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        text: &str,
        sink: &mut WsSink,
        sync: &mut SyncProgress,
    ) -> Result<(), SessionError> {
        let msg = match WireMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame in room {}: {e}", self.shared.room_id);
                return Ok(());
            }
        };

        match msg {
            WireMessage::Op(op_msg) => match Operation::try_from(op_msg) {
                Ok(op) => self.merge_remote(vec![op]),
                Err(e) => log::warn!("Dropping operation in room {}: {e}", self.shared.room_id),
            },

            WireMessage::Presence(presence) => {
                let snapshot = {
                    let mut channel = lock(&self.shared.presence);
                    channel.observe(presence, Instant::now());
                    channel.snapshot()
                };
                self.shared.notify_presence(&snapshot);
            }

            WireMessage::SyncRequest => {
                let ops = {
                    let doc = lock(&self.shared.doc);
                    let mut ops = doc.replica().op_log().to_vec();
                    ops.extend(doc.replica().pending_ops());
                    ops
                };
                log::debug!("Answering sync-request with {} operations", ops.len());
                for frame in WireMessage::sync_responses(&ops, self.shared.config.sync_response_cap) {
                    send_frame(sink, &frame).await?;
                }
            }

            WireMessage::SyncResponse { ops, last } => {
                let mut batch = Vec::with_capacity(ops.len());
                for op_msg in ops {
                    match Operation::try_from(op_msg) {
                        Ok(op) => {
                            sync.received.insert(op.id());
                            batch.push(op);
                        }
                        Err(e) => log::warn!("Dropping operation in room {}: {e}", self.shared.room_id),
                    }
                }
                self.merge_remote(batch);
                if last && !sync.done {
                    self.finish_sync(sink, sync).await?;
                }
            }
        }
        Ok(())
    }

    /// Seed the room if asked to, send whatever of ours the relay lacks,
    /// then switch to streaming.
    async fn finish_sync(&mut self, sink: &mut WsSink, sync: &mut SyncProgress) -> Result<(), SessionError> {
        sync.done = true;

        let missing: Vec<Operation> = {
            let mut doc = lock(&self.shared.doc);
            if let Some(assets) = self.initial.take() {
                if doc.is_empty() {
                    let seeded = doc.seed(assets);
                    log::info!("Seeded room {} with {} assets", self.shared.room_id, seeded.len());
                    self.shared.publish_assets(&doc);
                } else {
                    log::debug!("Room {} already has content, not seeding", self.shared.room_id);
                }
            }
            // Seeded ops are in the op log; the outgoing queue only duplicates them.
            doc.drain_outgoing();

            let peer = doc.peer_id();
            let missing = doc
                .replica()
                .op_log()
                .iter()
                .filter(|op| op.origin() == peer)
                .filter(|op| !sync.received.contains(&op.id()) && !sync.sent.contains(&op.id()))
                .cloned()
                .collect();
            missing
        };

        if !missing.is_empty() {
            log::info!("Sending {} local operations the relay has not seen", missing.len());
        }
        for op in &missing {
            send_frame(sink, &WireMessage::op(op)).await?;
        }

        self.shared.set_state(ConnectionState::Connected);
        log::info!("Room {} synced", self.shared.room_id);
        Ok(())
    }

    /// Merge remote operations, then run callbacks outside the document lock.
    fn merge_remote(&self, ops: Vec<Operation>) {
        if ops.is_empty() {
            return;
        }
        let mut fresh = Vec::new();
        {
            let mut doc = lock(&self.shared.doc);
            for op in ops {
                let result = doc.apply_remote(op.clone());
                log::debug!("Room {}: remote op {} → {result:?}", self.shared.room_id, op.id());
                if result.is_new() {
                    fresh.push(op);
                }
            }
            self.shared.publish_assets(&doc);
        }
        for op in &fresh {
            self.shared.notify_remote_op(op);
        }
    }

    /// Periodic housekeeping: stale presence and orphaned inserts.
    fn expire(&self) {
        let now = Instant::now();
        let snapshot = {
            let mut presence = lock(&self.shared.presence);
            if presence.expire(now).is_empty() {
                None
            } else {
                Some(presence.snapshot())
            }
        };
        if let Some(snapshot) = snapshot {
            self.shared.notify_presence(&snapshot);
        }

        let mut doc = lock(&self.shared.doc);
        let anomalies = doc.expire_orphans(now);
        if !anomalies.is_empty() {
            self.shared.publish_assets(&doc);
        }
    }
}

async fn send_frame(sink: &mut WsSink, msg: &WireMessage) -> Result<(), SessionError> {
    let text = msg.encode().map_err(|e| SessionError::Transport(e.to_string()))?;
    sink.send(Message::text(text))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}
