//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients, verifying the
//! full pipeline: join, submit, transform, broadcast, acknowledge.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_collab::authority::RoomRegistry;
use scribe_collab::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use scribe_collab::protocol::{ClientMessage, ErrorCode, JoinRequest, ServerMessage};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_core::Operation;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

type RawSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port and its room registry.
async fn start_test_server_with(config: ServerConfig) -> (u16, Arc<RoomRegistry>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    };
    let server = SyncServer::new(config);
    let registry = server.registry().clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, registry)
}

async fn start_test_server() -> u16 {
    let config = ServerConfig {
        max_peers_per_room: 10,
        outbound_capacity: 64,
        ..ServerConfig::default()
    };
    start_test_server_with(config).await.0
}

// ─── raw socket helpers ──────────────────────────────────────────

async fn raw_connect(port: u16) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

async fn raw_send(ws: &mut RawSocket, msg: &ClientMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into())).await.unwrap();
}

/// Next server frame, skipping transport-level pings.
async fn raw_recv(ws: &mut RawSocket) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("server frame within timeout")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = msg {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

/// First server frame matching `pred`.
async fn raw_recv_until(ws: &mut RawSocket, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    loop {
        let msg = raw_recv(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

/// Connect, join and consume the `init`.
async fn raw_join(port: u16, room: &str, user: &str) -> (RawSocket, String, u64) {
    let mut ws = raw_connect(port).await;
    raw_send(&mut ws, &ClientMessage::Join(JoinRequest::new(room, user, user))).await;
    match raw_recv(&mut ws).await {
        ServerMessage::Init { document, revision, .. } => (ws, document, revision),
        other => panic!("Expected init, got {other:?}"),
    }
}

fn is_operation(msg: &ServerMessage) -> bool {
    matches!(msg, ServerMessage::Operation { .. })
}

// ─── client helpers ──────────────────────────────────────────────

async fn connect_client(port: u16, room: &str, user: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let url = format!("ws://127.0.0.1:{port}");
    let mut client = SyncClient::new(JoinRequest::new(room, user, user), url, ClientConfig::default());
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await;
    (client, events)
}

async fn wait_for(events: &mut mpsc::Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within timeout")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}

/// Wait until every client has nothing in flight and all agree.
async fn converged(clients: &[&SyncClient]) -> String {
    for _ in 0..200 {
        let mut contents = Vec::new();
        let mut idle = true;
        for client in clients {
            contents.push(client.content().await);
            idle &= client.pending_len().await == 0 && client.is_synced().await;
        }
        if idle && contents.windows(2).all(|w| w[0] == w[1]) {
            return contents.remove(0);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("clients did not converge");
}

// ─── wire protocol ───────────────────────────────────────────────

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_join_receives_init() {
    let port = start_test_server().await;
    let mut ws = raw_connect(port).await;
    raw_send(&mut ws, &ClientMessage::Join(JoinRequest::new("notes", "alice", "Alice"))).await;

    match raw_recv(&mut ws).await {
        ServerMessage::Init {
            document,
            revision,
            presence,
        } => {
            assert_eq!(document, "");
            assert_eq!(revision, 0);
            assert_eq!(presence.len(), 1);
            assert_eq!(presence[0].user_id, "alice");
            assert_eq!(presence[0].display_name, "Alice");
        }
        other => panic!("Expected init, got {other:?}"),
    }
}

#[tokio::test]
async fn test_first_frame_must_be_join() {
    let port = start_test_server().await;
    let mut ws = raw_connect(port).await;
    raw_send(&mut ws, &ClientMessage::Ping).await;

    match raw_recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotJoined),
        other => panic!("Expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_frame_is_reported() {
    let port = start_test_server().await;
    let (mut ws, _, _) = raw_join(port, "notes", "alice").await;

    ws.send(Message::Text("{\"type\":\"teleport\"}".into())).await.unwrap();
    match raw_recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::BadFrame),
        other => panic!("Expected error, got {other:?}"),
    }

    // The session survives a bad frame.
    raw_send(&mut ws, &ClientMessage::Ping).await;
    assert_eq!(raw_recv(&mut ws).await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_submit_is_acknowledged_with_revision() {
    let port = start_test_server().await;
    let (mut ws, _, rev) = raw_join(port, "notes", "alice").await;
    assert_eq!(rev, 0);

    for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
        raw_send(&mut ws, &ClientMessage::submit(Operation::insert(i, text), i as u64)).await;
        match raw_recv_until(&mut ws, is_operation).await {
            ServerMessage::Operation {
                operation,
                revision,
                user_id,
            } => {
                assert_eq!(revision, i as u64 + 1);
                assert_eq!(user_id, "alice");
                assert_eq!(operation, Operation::insert(i, text));
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_omitted_revision_means_current() {
    let port = start_test_server().await;
    let (mut ws, _, _) = raw_join(port, "notes", "alice").await;

    raw_send(
        &mut ws,
        &ClientMessage::Operation {
            operation: Operation::insert(0, "hi"),
            revision: None,
        },
    )
    .await;
    match raw_recv_until(&mut ws, is_operation).await {
        ServerMessage::Operation { revision, .. } => assert_eq!(revision, 1),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_stale_submission_is_transformed() {
    let port = start_test_server().await;
    let (mut alice, _, _) = raw_join(port, "notes", "alice").await;
    let (mut bob, _, _) = raw_join(port, "notes", "bob").await;

    // Both build on revision 0; alice gets there first.
    raw_send(&mut alice, &ClientMessage::submit(Operation::insert(0, "abc"), 0)).await;
    match raw_recv_until(&mut bob, is_operation).await {
        ServerMessage::Operation { revision, user_id, .. } => {
            assert_eq!(revision, 1);
            assert_eq!(user_id, "alice");
        }
        _ => unreachable!(),
    }

    raw_send(&mut bob, &ClientMessage::submit(Operation::insert(0, "Z"), 0)).await;
    let expected = ServerMessage::Operation {
        operation: Operation::insert(3, "Z"),
        revision: 2,
        user_id: "bob".into(),
    };
    assert_eq!(raw_recv_until(&mut bob, is_operation).await, expected);
    assert_eq!(raw_recv_until(&mut alice, |m| m == &expected).await, expected);
}

#[tokio::test]
async fn test_revision_ahead_is_rejected_then_resynced() {
    let port = start_test_server().await;
    let (mut ws, _, _) = raw_join(port, "notes", "alice").await;

    raw_send(&mut ws, &ClientMessage::submit(Operation::insert(0, "x"), 5)).await;
    match raw_recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::RevisionAhead),
        other => panic!("Expected error, got {other:?}"),
    }
    match raw_recv(&mut ws).await {
        ServerMessage::Init { document, revision, .. } => {
            assert_eq!(document, "");
            assert_eq!(revision, 0);
        }
        other => panic!("Expected init, got {other:?}"),
    }
}

#[tokio::test]
async fn test_out_of_bounds_is_rejected() {
    let port = start_test_server().await;
    let (mut ws, _, _) = raw_join(port, "notes", "alice").await;

    raw_send(&mut ws, &ClientMessage::submit(Operation::delete(0, 5), 0)).await;
    match raw_recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::OutOfBounds),
        other => panic!("Expected error, got {other:?}"),
    }
    assert!(matches!(raw_recv(&mut ws).await, ServerMessage::Init { revision: 0, .. }));
}

#[tokio::test]
async fn test_room_full() {
    let config = ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    };
    let (port, _) = start_test_server_with(config).await;
    let (_alice, _, _) = raw_join(port, "notes", "alice").await;

    let mut bob = raw_connect(port).await;
    raw_send(&mut bob, &ClientMessage::Join(JoinRequest::new("notes", "bob", "Bob"))).await;
    match raw_recv(&mut bob).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::RoomFull),
        other => panic!("Expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (port, registry) = start_test_server_with(ServerConfig::default()).await;
    let (mut a, _, _) = raw_join(port, "one", "alice").await;
    let (_b, doc, _) = raw_join(port, "two", "bob").await;
    assert_eq!(doc, "");

    raw_send(&mut a, &ClientMessage::submit(Operation::insert(0, "only here"), 0)).await;
    raw_recv_until(&mut a, is_operation).await;

    assert_eq!(registry.active_rooms().await, vec!["one".to_string(), "two".to_string()]);
    let two = registry.get("two").await.unwrap().inspect().await.unwrap();
    assert_eq!(two.content, "");
    let one = registry.get("one").await.unwrap().inspect().await.unwrap();
    assert_eq!(one.content, "only here");
    assert_eq!(one.revision, 1);
}

#[tokio::test]
async fn test_reconnect_replaces_session() {
    let (port, registry) = start_test_server_with(ServerConfig::default()).await;
    let (mut first, _, _) = raw_join(port, "notes", "alice").await;
    let (_second, _, _) = raw_join(port, "notes", "alice").await;

    // The superseded socket is closed by the server.
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                _ => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "superseded session should be closed");

    let room = registry.get("notes").await.unwrap().inspect().await.unwrap();
    assert_eq!(room.sessions, 1);
    assert_eq!(room.presence.len(), 1);
}

// ─── SyncClient ──────────────────────────────────────────────────

#[tokio::test]
async fn test_client_connects_and_syncs() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let mut client = SyncClient::new(JoinRequest::new("notes", "alice", "Alice"), url, ClientConfig::default());
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert_eq!(wait_for(&mut events, |_| true).await, SyncEvent::Connected);
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await,
        SyncEvent::Synced {
            content: String::new(),
            revision: 0
        }
    );
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert!(client.is_synced().await);
}

#[tokio::test]
async fn test_client_edit_is_acknowledged() {
    let port = start_test_server().await;
    let (client, mut events) = connect_client(port, "notes", "alice").await;

    client.edit("hello").await.unwrap();
    assert_eq!(client.pending_len().await, 1);
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await,
        SyncEvent::Acknowledged { revision: 1 }
    );
    assert_eq!(client.pending_len().await, 0);
    assert_eq!(client.revision().await, 1);
    assert_eq!(client.content().await, "hello");
}

#[tokio::test]
async fn test_queued_edits_go_out_one_at_a_time() {
    let port = start_test_server().await;
    let (client, mut events) = connect_client(port, "notes", "alice").await;

    for (i, c) in ["a", "b", "c", "d"].into_iter().enumerate() {
        client.apply_local(Operation::insert(i, c)).await.unwrap();
    }
    for expected in 1..=4 {
        assert_eq!(
            wait_for(&mut events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await,
            SyncEvent::Acknowledged { revision: expected }
        );
    }
    assert_eq!(converged(&[&client]).await, "abcd");
}

#[tokio::test]
async fn test_remote_operation_reaches_peer() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connect_client(port, "notes", "alice").await;
    let (bob, mut bob_events) = connect_client(port, "notes", "bob").await;

    alice.edit("shared").await.unwrap();
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await {
        SyncEvent::RemoteOperation {
            user_id,
            operation,
            revision,
        } => {
            assert_eq!(user_id, "alice");
            assert_eq!(operation, Operation::insert(0, "shared"));
            assert_eq!(revision, 1);
        }
        _ => unreachable!(),
    }
    assert_eq!(bob.content().await, "shared");
}

#[tokio::test]
async fn test_late_joiner_gets_current_document() {
    let port = start_test_server().await;
    let (alice, _events) = connect_client(port, "notes", "alice").await;
    alice.edit("already here").await.unwrap();
    converged(&[&alice]).await;

    let (bob, _) = connect_client(port, "notes", "bob").await;
    assert_eq!(bob.content().await, "already here");
    assert_eq!(bob.revision().await, 1);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let port = start_test_server().await;
    let (alice, _a) = connect_client(port, "notes", "alice").await;
    let (bob, _b) = connect_client(port, "notes", "bob").await;

    alice.edit("abc").await.unwrap();
    assert_eq!(converged(&[&alice, &bob]).await, "abc");

    // Neither has seen the other's edit when making its own.
    alice.apply_local(Operation::insert(0, "X")).await.unwrap();
    bob.apply_local(Operation::delete(1, 1)).await.unwrap();

    assert_eq!(converged(&[&alice, &bob]).await, "Xac");
    assert_eq!(alice.revision().await, bob.revision().await);
}

#[tokio::test]
async fn test_many_concurrent_edits_converge() {
    let port = start_test_server().await;
    let (alice, _a) = connect_client(port, "notes", "alice").await;
    let (bob, _b) = connect_client(port, "notes", "bob").await;
    let (carol, _c) = connect_client(port, "notes", "carol").await;

    alice.edit("0123456789").await.unwrap();
    converged(&[&alice, &bob, &carol]).await;

    for _ in 0..10 {
        alice.apply_local(Operation::insert(0, "a")).await.unwrap();
        bob.apply_local(Operation::insert(0, "b")).await.unwrap();
        carol.apply_local(Operation::insert(0, "c")).await.unwrap();
    }

    let content = converged(&[&alice, &bob, &carol]).await;
    assert_eq!(content.matches('a').count(), 10);
    assert_eq!(content.matches('b').count(), 10);
    assert_eq!(content.matches('c').count(), 10);
    assert!(content.ends_with("0123456789"));
}

#[tokio::test]
async fn test_offline_edits_replayed_on_reconnect() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let mut alice = SyncClient::new(JoinRequest::new("notes", "alice", "Alice"), url, ClientConfig::default());
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await;

    alice.edit("hello").await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;

    alice.disconnect().await;
    wait_for(&mut events, |e| *e == SyncEvent::Disconnected).await;

    alice.edit("hello world").await.unwrap();
    assert_eq!(alice.offline_queue_len().await, 1);
    assert!(!alice.is_synced().await);

    alice.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await;
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await,
        SyncEvent::Acknowledged { revision: 2 }
    );
    assert_eq!(alice.offline_queue_len().await, 0);

    let (bob, _) = connect_client(port, "notes", "bob").await;
    assert_eq!(converged(&[&alice, &bob]).await, "hello world");
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server().await;
    let (mut ws, _, _) = raw_join(port, "notes", "alice").await;
    raw_send(&mut ws, &ClientMessage::Ping).await;
    assert_eq!(raw_recv_until(&mut ws, |m| *m == ServerMessage::Pong).await, ServerMessage::Pong);
}
