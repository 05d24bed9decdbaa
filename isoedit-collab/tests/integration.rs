//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real relay and connect real clients,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use isoedit_collab::client::{ConnectionState, SyncClient};
use isoedit_collab::protocol::WireMessage;
use isoedit_collab::server::{RelayConfig, RelayServer};
use isoedit_collab::session::{RoomHandle, SessionConfig};
use isoedit_core::{Asset, GridPos, OpId, Operation, PeerId, ReplicaState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> RelayConfig {
    RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 256,
        ..RelayConfig::default()
    }
}

/// Start a relay on a free port, return it with its websocket base url.
async fn start_test_server_with(configure: impl FnOnce(&mut RelayConfig)) -> (Arc<RelayServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = test_config(port);
    configure(&mut config);

    let server = Arc::new(RelayServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn start_test_server() -> (Arc<RelayServer>, String) {
    start_test_server_with(|_| {}).await
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

async fn join_connected(url: &str, room: &str) -> RoomHandle {
    let room = SyncClient::new(url, fast_session()).join(room);
    timeout(Duration::from_secs(5), room.wait_connected())
        .await
        .expect("connect timed out")
        .expect("connection failed");
    room
}

/// Poll `check` until it holds, failing the test after five seconds.
async fn eventually(what: &str, check: impl FnMut() -> bool) {
    eventually_within(Duration::from_secs(5), what, check).await
}

async fn eventually_within(limit: Duration, what: &str, mut check: impl FnMut() -> bool) {
    let result = timeout(limit, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

fn cube(x: i32, z: i32) -> Asset {
    Asset::cube(GridPos::new(x, 0, z), "#ff0000", None)
}

fn ids(room: &RoomHandle) -> Vec<OpId> {
    room.snapshot().iter().map(|r| r.id).collect()
}

/// Connect without the session layer and wait until the relay has
/// answered a sync-request, which means the connection joined the room.
async fn raw_join(url: &str, room: &str) -> (RawSocket, Vec<Operation>) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/{room}")).await.unwrap();
    ws.send(Message::text(WireMessage::SyncRequest.encode().unwrap())).await.unwrap();

    let mut history = Vec::new();
    loop {
        match next_wire(&mut ws).await {
            Some(WireMessage::SyncResponse { ops, last }) => {
                history.extend(ops.into_iter().map(|op| Operation::try_from(op).unwrap()));
                if last {
                    return (ws, history);
                }
            }
            Some(_) => {}
            None => panic!("relay closed before answering sync-request"),
        }
    }
}

async fn next_wire(ws: &mut RawSocket) -> Option<WireMessage> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(WireMessage::decode(text.as_str()).unwrap()),
            Ok(Some(Ok(Message::Ping(_)))) => continue,
            _ => return None,
        }
    }
}

/// TCP forwarder in front of the relay that can cut every connection
/// through it and refuse new ones until restored.
struct CuttableLink {
    url: String,
    open: Arc<AtomicBool>,
    cut: broadcast::Sender<()>,
}

impl CuttableLink {
    async fn start(relay_url: &str) -> Self {
        let upstream = relay_url.trim_start_matches("ws://").to_string();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let open = Arc::new(AtomicBool::new(true));
        let (cut, _) = broadcast::channel(4);

        let accepting = open.clone();
        let cut_signal = cut.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                if !accepting.load(Ordering::SeqCst) {
                    continue;
                }
                let mut cut_rx = cut_signal.subscribe();
                let upstream = upstream.clone();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(&upstream).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = cut_rx.recv() => {}
                    }
                });
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}"),
            open,
            cut,
        }
    }

    fn cut(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.cut.send(());
    }

    fn restore(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

fn authored_ops(count: usize) -> Vec<Operation> {
    let mut author = ReplicaState::with_defaults(PeerId::new());
    for x in 0..count {
        author.local_insert(cube(x as i32, 0));
    }
    author.drain_outgoing()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server().await;

    let result = tokio_tungstenite::connect_async(format!("{url}/room")).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_run_binds_configured_address() {
    let port = free_port().await;
    let server = RelayServer::new(test_config(port));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;

    let (_ws, history) = raw_join(&format!("ws://127.0.0.1:{port}"), "room").await;
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_client_connects_and_syncs() {
    let (server, url) = start_test_server().await;
    let room = join_connected(&url, "map").await;

    assert_eq!(room.connection_state(), ConnectionState::Connected);
    assert_eq!(room.room_id(), "map");
    assert_eq!(server.room_count().await, 1);
}

#[tokio::test]
async fn test_edits_propagate_between_clients() {
    let (_server, url) = start_test_server().await;
    let alice = join_connected(&url, "map").await;
    let bob = join_connected(&url, "map").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bob.on_remote_op(move |op| sink.lock().unwrap().push(op.id()));
    let mut bob_assets = bob.subscribe_assets();

    let id = alice.local_insert(cube(2, 3));
    timeout(Duration::from_secs(5), bob_assets.wait_for(|assets| assets.len() == 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ids(&bob), vec![id]);
    assert_eq!(*seen.lock().unwrap(), vec![id]);

    assert!(bob.local_delete(id));
    eventually("alice to see bob's delete", || alice.is_empty()).await;
}

#[tokio::test]
async fn test_late_joiner_receives_history() {
    let (_server, url) = start_test_server().await;
    let alice = join_connected(&url, "map").await;

    let a = alice.local_insert(cube(0, 0));
    let b = alice.local_insert(cube(1, 0));
    let c = alice.local_insert(cube(2, 0));
    alice.local_delete(b);
    sleep(Duration::from_millis(200)).await;

    let bob = join_connected(&url, "map").await;
    assert_eq!(ids(&bob), vec![a, c]);
    assert_eq!(bob.snapshot(), alice.snapshot());
}

#[tokio::test]
async fn test_concurrent_same_cell_inserts_both_survive() {
    let (_server, url) = start_test_server().await;
    let alice = join_connected(&url, "map").await;
    let bob = join_connected(&url, "map").await;

    let cell = GridPos::new(2, 0, 3);
    let r1 = alice.local_insert(Asset::cube(cell, "#ff0000", None));
    let r2 = bob.local_insert(Asset::model(cell, "bus_stop", Some(90), None));

    eventually("both peers to hold both records", || alice.len() == 2 && bob.len() == 2).await;
    assert_eq!(alice.snapshot(), bob.snapshot());
    let both = ids(&alice);
    assert!(both.contains(&r1) && both.contains(&r2));
}

#[tokio::test]
async fn test_undo_propagates_and_redo_restores() {
    let (_server, url) = start_test_server().await;
    let alice = join_connected(&url, "map").await;
    let bob = join_connected(&url, "map").await;

    alice.local_insert(cube(1, 1));
    eventually("bob to see the insert", || bob.len() == 1).await;

    assert!(alice.undo());
    eventually("bob to see the undo", || bob.is_empty()).await;

    assert!(alice.redo());
    eventually("bob to see the redo", || bob.len() == 1).await;
    assert_eq!(alice.snapshot(), bob.snapshot());
}

#[tokio::test]
async fn test_undo_skips_record_deleted_by_peer() {
    let (_server, url) = start_test_server().await;
    let alice = join_connected(&url, "map").await;
    let bob = join_connected(&url, "map").await;

    let id = alice.local_insert(cube(0, 0));
    eventually("bob to see the insert", || bob.len() == 1).await;
    alice.local_delete(id);
    eventually("bob to see the delete", || bob.is_empty()).await;

    // Bob removes it too, then alice's undo of her delete must not bring it back.
    bob.send(Operation::delete(OpId::new(bob.peer_id(), 100), id)).unwrap();
    sleep(Duration::from_millis(200)).await;

    assert!(!alice.undo());
    assert!(alice.is_empty());
    assert!(bob.is_empty());
}

#[tokio::test]
async fn test_offline_edits_replayed_on_connect() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let config = SessionConfig {
        max_retries: 200,
        ..fast_session()
    };
    let alice = SyncClient::new(&url, config).join("map");
    let a = alice.local_insert(cube(0, 0));
    let b = alice.local_insert(cube(1, 0));
    sleep(Duration::from_millis(100)).await;
    assert_ne!(alice.connection_state(), ConnectionState::Connected);

    let server = RelayServer::new(test_config(port));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    timeout(Duration::from_secs(5), alice.wait_connected()).await.unwrap().unwrap();

    let bob = join_connected(&url, "map").await;
    assert_eq!(ids(&bob), vec![a, b]);
}

#[tokio::test]
async fn test_reconnect_after_retries_exhausted() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let config = SessionConfig {
        max_retries: 1,
        ..fast_session()
    };
    let alice = SyncClient::new(&url, config).join("map");
    let result = timeout(Duration::from_secs(5), alice.wait_connected()).await.unwrap();
    assert!(result.is_err());
    assert_eq!(alice.connection_state(), ConnectionState::Disconnected);

    // Edits keep working while disconnected and reach the relay later.
    let id = alice.local_insert(cube(5, 5));

    let server = RelayServer::new(test_config(port));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;

    let mut state = alice.subscribe_state();
    alice.reconnect().unwrap();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    let bob = join_connected(&url, "map").await;
    assert_eq!(ids(&bob), vec![id]);
}

#[tokio::test]
async fn test_initial_assets_seed_only_an_empty_room() {
    let (_server, url) = start_test_server().await;

    let alice = SyncClient::new(&url, fast_session()).join_with_assets("map", vec![cube(0, 0), cube(1, 0)]);
    timeout(Duration::from_secs(5), alice.wait_connected()).await.unwrap().unwrap();
    assert_eq!(alice.len(), 2);
    // Seeding is not an undoable user action.
    assert!(!alice.can_undo());
    sleep(Duration::from_millis(100)).await;

    let bob = SyncClient::new(&url, fast_session()).join_with_assets("map", vec![cube(9, 9)]);
    timeout(Duration::from_secs(5), bob.wait_connected()).await.unwrap().unwrap();
    assert_eq!(bob.snapshot(), alice.snapshot());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.len(), 2);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (server, url) = start_test_server().await;
    let alice = join_connected(&url, "downtown").await;
    let bob = join_connected(&url, "harbor").await;

    alice.local_insert(cube(0, 0));
    sleep(Duration::from_millis(200)).await;

    assert!(bob.is_empty());
    assert_eq!(server.room_count().await, 2);
    assert_eq!(server.room_len("downtown").await, Some(1));
    assert_eq!(server.room_len("harbor").await, Some(0));
}

#[tokio::test]
async fn test_relay_drops_duplicate_operations() {
    let (_server, url) = start_test_server().await;
    let (mut sender, _) = raw_join(&url, "map").await;
    let (mut receiver, _) = raw_join(&url, "map").await;

    let op = authored_ops(1).remove(0);
    let frame = WireMessage::op(&op).encode().unwrap();
    sender.send(Message::text(frame.clone())).await.unwrap();
    sender.send(Message::text(frame)).await.unwrap();

    match next_wire(&mut receiver).await {
        Some(WireMessage::Op(msg)) => assert_eq!(msg.id(), op.id()),
        other => panic!("expected op, got {other:?}"),
    }
    let extra = timeout(Duration::from_millis(200), receiver.next()).await;
    assert!(extra.is_err(), "duplicate should not be relayed");
}

#[tokio::test]
async fn test_sync_response_is_chunked() {
    let (_server, url) = start_test_server_with(|config| config.sync_response_cap = 2).await;
    let (mut author, _) = raw_join(&url, "map").await;
    let ops = authored_ops(5);
    for op in &ops {
        author.send(Message::text(WireMessage::op(op).encode().unwrap())).await.unwrap();
    }
    // The author's own sync-request is answered after its ops were merged.
    author.send(Message::text(WireMessage::SyncRequest.encode().unwrap())).await.unwrap();
    let mut frames = 0;
    loop {
        match next_wire(&mut author).await {
            Some(WireMessage::SyncResponse { last, .. }) => {
                frames += 1;
                if last {
                    break;
                }
            }
            Some(_) => {}
            None => panic!("missing sync-response"),
        }
    }
    assert_eq!(frames, 3);

    let (_late, history) = raw_join(&url, "map").await;
    let ids: Vec<OpId> = history.iter().map(Operation::id).collect();
    assert_eq!(ids, ops.iter().map(Operation::id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_malformed_frames_keep_the_connection() {
    let (server, url) = start_test_server().await;
    let (mut ws, _) = raw_join(&url, "map").await;

    ws.send(Message::text("not json")).await.unwrap();
    ws.send(Message::text(r#"{"type":"op","peerId":"00000000-0000-0000-0000-000000000001","counter":1,"opKind":"insert"}"#))
        .await
        .unwrap();
    ws.send(Message::text(WireMessage::SyncRequest.encode().unwrap())).await.unwrap();

    assert!(matches!(next_wire(&mut ws).await, Some(WireMessage::SyncResponse { .. })));
    assert_eq!(server.stats().await.anomalies, 2);
}

#[tokio::test]
async fn test_full_room_rejects_connection() {
    let (server, url) = start_test_server_with(|config| config.max_peers_per_room = 1).await;
    let (_first, _) = raw_join(&url, "map").await;

    let (mut second, _) = tokio_tungstenite::connect_async(format!("{url}/map")).await.unwrap();
    let next = timeout(Duration::from_secs(2), second.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    assert_eq!(server.stats().await.rejected_connections, 1);
}

#[tokio::test]
async fn test_relay_stats_track_connections() {
    let (server, url) = start_test_server().await;
    let alice = join_connected(&url, "map").await;
    let _bob = join_connected(&url, "map").await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages >= 2);

    alice.leave().await;
    let mut active = 2;
    for _ in 0..100 {
        active = server.stats().await.active_connections;
        if active == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(active, 1);
    // Rooms outlive their connections by default.
    assert_eq!(server.room_count().await, 1);
}

#[tokio::test]
async fn test_lagging_client_catches_up_from_room_log() {
    let (server, url) = start_test_server_with(|c| c.broadcast_capacity = 1).await;
    let bob = join_connected(&url, "map").await;

    let (raw, _) = raw_join(&url, "map").await;
    let (mut sink, mut stream) = raw.split();
    tokio::spawn(async move { while stream.next().await.is_some() {} });

    let ops = authored_ops(200);
    for op in &ops {
        sink.send(Message::text(WireMessage::op(op).encode().unwrap())).await.unwrap();
    }

    eventually_within(Duration::from_secs(10), "bob to catch up after lagging", || bob.len() == 200).await;
    assert_eq!(server.room_len("map").await, Some(200));
    let mut got = ids(&bob);
    got.sort();
    let mut want: Vec<OpId> = ops.iter().map(|op| op.id()).collect();
    want.sort();
    assert_eq!(got, want);
}

#[tokio::test]
async fn test_partitioned_client_converges_after_reconnect() {
    let (_server, url) = start_test_server().await;
    let link = CuttableLink::start(&url).await;
    let config = SessionConfig {
        max_retries: 50,
        ..fast_session()
    };
    let alice = SyncClient::new(&link.url, config).join("map");
    timeout(Duration::from_secs(5), alice.wait_connected()).await.unwrap().unwrap();
    let bob = join_connected(&url, "map").await;

    let shared = alice.local_insert(cube(0, 0));
    eventually("bob to see alice's first edit", || bob.len() == 1).await;

    link.cut();
    let mut state = alice.subscribe_state();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s != ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    // Both sides edit while the link is down.
    let offline = alice.local_insert(cube(1, 0));
    let online = bob.local_insert(cube(2, 0));
    assert!(bob.local_delete(shared));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.len(), 2);
    assert_eq!(bob.len(), 1);

    link.restore();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    eventually("both replicas to converge", || {
        alice.snapshot() == bob.snapshot() && alice.len() == 2
    })
    .await;
    let mut live = ids(&alice);
    live.sort();
    let mut want = vec![offline, online];
    want.sort();
    assert_eq!(live, want);
}
