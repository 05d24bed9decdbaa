//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("ws://host/<room>") ── ReplicaState ── BroadcastGroup
//! Client B ──┘                                     │
//!                                        ┌─────────┼─────────┐
//!                                        ▼         ▼         ▼
//!                                     Client A  Client B  Client C
//! ```
//!
//! Each room keeps:
//! - an authoritative `ReplicaState` merging every op it relays, used to
//!   answer `sync-request` with the full op log
//! - a `BroadcastGroup` fanning frames out to the other connections
//! - the latest presence frame per connection, replayed to newcomers
//!
//! The relay never authors operations. Duplicates are not forwarded, so a
//! client replaying its outbox after a reconnect costs the room nothing.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use isoedit_core::{Operation, PeerId, ReplicaConfig, ReplicaState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ConnectionId, RelayFrame};
use crate::protocol::WireMessage;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per connection before a slow one starts losing them.
    pub broadcast_capacity: usize,
    /// Maximum operations per `sync-response` frame.
    pub sync_response_cap: usize,
    /// How long a room replica holds an insert whose anchor is missing.
    pub buffer_window: Duration,
    /// Keep a room's replica after its last connection leaves.
    pub keep_empty_rooms: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 1024,
            sync_response_cap: 512,
            buffer_window: Duration::from_secs(5),
            keep_empty_rooms: true,
        }
    }
}

/// Relay-wide counters, see [`RelayServer::stats`].
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub relayed_ops: u64,
    pub anomalies: u64,
    /// Times a lagging connection was sent the full room log.
    pub lag_resyncs: u64,
    pub active_rooms: usize,
}

struct RelayRoom {
    replica: ReplicaState,
    broadcast: Arc<BroadcastGroup>,
}

impl RelayRoom {
    fn new(config: &RelayConfig) -> Self {
        let replica_config = ReplicaConfig {
            buffer_window: config.buffer_window,
        };
        Self {
            replica: ReplicaState::new(PeerId::from_uuid(Uuid::nil()), replica_config),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, RelayRoom>>>;

/// Everything a connection task needs, cloned per connection.
#[derive(Clone)]
struct RelayContext {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    /// Create a relay with no rooms.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a relay with `RelayConfig::default()`.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let conn = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let ctx = RelayContext {
                config: self.config.clone(),
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
            };

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, conn, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Snapshot of the relay counters.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Address the relay binds in `run`.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Number of rooms the relay holds state for.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Live record count of a room's replica.
    pub async fn room_len(&self, room: &str) -> Option<usize> {
        self.rooms.read().await.get(room).map(|r| r.replica.len())
    }
}

/// Room key from the websocket request path: `/my-map` → `my-map`.
fn room_key(path: &str) -> Option<String> {
    let key = path.trim_matches('/');
    (!key.is_empty()).then(|| key.to_string())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnectionId,
    ctx: RelayContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let Some(room_id) = room_key(&path) else {
        log::warn!("Rejecting {addr}: no room in path {path:?}");
        ctx.stats.write().await.rejected_connections += 1;
        ws_sender.send(Message::Close(None)).await?;
        return Ok(());
    };

    // Join the room
    let (group, mut broadcast_rx) = {
        let mut rooms = ctx.rooms.write().await;
        let room = rooms.entry(room_id.clone()).or_insert_with(|| RelayRoom::new(&ctx.config));
        let group = room.broadcast.clone();
        if group.member_count().await >= ctx.config.max_peers_per_room {
            drop(rooms);
            log::warn!("Rejecting {addr}: room {room_id} is full");
            ctx.stats.write().await.rejected_connections += 1;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }
        let rx = group.add_member(conn).await;
        let room_count = rooms.len();
        drop(rooms);

        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        s.active_rooms = room_count;
        (group, rx)
    };
    log::info!("Connection {conn} from {addr} joined room {room_id}");

    for frame in group.presence_frames(conn).await {
        ws_sender.send(Message::text(frame.to_string())).await?;
    }

    let result = relay_loop(conn, &room_id, &ctx, &group, &mut broadcast_rx, &mut ws_sender, &mut ws_receiver).await;

    // Cleanup: leave the room, forget presence (no retraction is broadcast)
    group.remove_member(conn).await;
    {
        let mut rooms = ctx.rooms.write().await;
        if !ctx.config.keep_empty_rooms && group.member_count().await == 0 {
            rooms.remove(&room_id);
            log::info!("Room {room_id} removed (empty)");
        }
        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = rooms.len();
    }
    log::info!("Connection {conn} left room {room_id}");
    result
}

type WsSender = futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;
type WsReceiver = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

async fn relay_loop(
    conn: ConnectionId,
    room_id: &str,
    ctx: &RelayContext,
    group: &BroadcastGroup,
    broadcast_rx: &mut broadcast::Receiver<RelayFrame>,
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        let text = text.as_str();
                        match WireMessage::decode(text) {
                            Ok(WireMessage::Op(op_msg)) => {
                                let op = match Operation::try_from(op_msg) {
                                    Ok(op) => op,
                                    Err(e) => {
                                        log::warn!("Dropping operation from connection {conn}: {e}");
                                        ctx.stats.write().await.anomalies += 1;
                                        continue;
                                    }
                                };
                                if merge_into_room(ctx, room_id, op).await {
                                    group.broadcast_raw(conn, Arc::from(text));
                                    ctx.stats.write().await.relayed_ops += 1;
                                }
                            }
                            Ok(WireMessage::Presence(presence)) => {
                                log::trace!("Presence from {} in room {room_id}", presence.peer_id);
                                let frame: Arc<str> = Arc::from(text);
                                group.remember_presence(conn, frame.clone()).await;
                                group.broadcast_raw(conn, frame);
                            }
                            Ok(WireMessage::SyncRequest) => {
                                let sent = send_room_log(ctx, room_id, ws_sender).await?;
                                log::debug!("Answered sync-request on connection {conn} with {sent} ops");
                            }
                            Ok(WireMessage::SyncResponse { .. }) => {
                                log::debug!("Ignoring sync-response sent to the relay by connection {conn}");
                            }
                            Err(e) => {
                                log::warn!("Failed to decode frame from connection {conn}: {e}");
                                ctx.stats.write().await.anomalies += 1;
                            }
                        }
                    }

                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("Ignoring binary frame from connection {conn}");
                        ctx.stats.write().await.anomalies += 1;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {conn} closed");
                        return Ok(());
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error on connection {conn}: {e}");
                        return Ok(());
                    }

                    _ => {}
                }
            }

            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        // Don't echo back to the sender
                        if frame.origin == conn {
                            continue;
                        }
                        ws_sender.send(Message::text(frame.text.to_string())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The skipped frames are gone from the channel; the room
                        // log still has every op, so resend all of it.
                        log::warn!("Connection {conn} lagged by {n} frames, resending room log");
                        group.record_dropped(n);
                        ctx.stats.write().await.lag_resyncs += 1;
                        send_room_log(ctx, room_id, ws_sender).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

/// Send the room's whole op log, buffered orphans included, as chunked
/// `sync-response` frames. Returns the number of ops sent.
async fn send_room_log(
    ctx: &RelayContext,
    room_id: &str,
    ws_sender: &mut WsSender,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let ops = {
        let rooms = ctx.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| {
                let mut ops = room.replica.op_log().to_vec();
                ops.extend(room.replica.pending_ops());
                ops
            })
            .unwrap_or_default()
    };
    for frame in WireMessage::sync_responses(&ops, ctx.config.sync_response_cap) {
        ws_sender.send(Message::text(frame.encode()?)).await?;
    }
    Ok(ops.len())
}

/// Merge an op into the room replica. Returns whether it should be relayed.
async fn merge_into_room(ctx: &RelayContext, room_id: &str, op: Operation) -> bool {
    let mut rooms = ctx.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        return false;
    };
    let id = op.id();
    let result = room.replica.apply(op);
    let expired = room.replica.expire_orphans(Instant::now());
    drop(rooms);

    if !expired.is_empty() {
        ctx.stats.write().await.anomalies += expired.len() as u64;
    }
    log::debug!("Room {room_id}: op {id} → {result:?}");
    result.is_new()
}
