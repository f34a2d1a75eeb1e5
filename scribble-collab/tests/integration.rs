//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use scribble_collab::client::{ConnectionState, SyncClient, SyncEvent};
use scribble_collab::config::ServerConfig;
use scribble_collab::operation::{Operation, Stroke, Tool, Vec2};
use futures_util::SinkExt;
use scribble_collab::protocol::{ClientMessage, CommitRejection, FrameCodec, JoinRejection};
use scribble_collab::server::SyncServer;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL and a handle.
async fn start_test_server_with(config: ServerConfig) -> (String, Arc<SyncServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    };
    let server = Arc::new(SyncServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), server)
}

async fn start_test_server() -> (String, Arc<SyncServer>) {
    start_test_server_with(ServerConfig {
        max_participants_per_room: 10,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    })
    .await
}

/// Connect and join `room`, returning once the join snapshot arrived.
async fn joined_client(url: &str, room: &str, name: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.join(room, Some(name)).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(events: &mut Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until the client's mirror reaches `revision`.
async fn wait_revision(client: &SyncClient, revision: u64) -> Vec<Operation> {
    timeout(Duration::from_secs(2), async {
        loop {
            if client.revision().await == Some(revision) && client.is_synced().await {
                return client.history().await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for revision")
}

fn stroke(x: f32) -> Stroke {
    let mut stroke = Stroke::begin(Vec2::new(x, x), Tool::Brush, "#1e90ff", 4.0);
    stroke.points.push(Vec2::new(x + 10.0, x));
    stroke
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _server) = start_test_server().await;

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_joins() {
    let (url, server) = start_test_server().await;

    let mut client = SyncClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    client.join("r1", Some("Alice")).await.unwrap();
    match wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await {
        SyncEvent::Joined { self_id, participant } => {
            assert_eq!(participant.id, self_id);
            assert_eq!(participant.display_name, "Alice");
            assert_eq!(participant.color, "#FF6B6B");
        }
        _ => unreachable!(),
    }

    assert_eq!(client.roster().await.len(), 1);
    assert_eq!(wait_revision(&client, 0).await.len(), 0);
    assert_eq!(server.participant_count("r1").await, 1);
}

/// A joins an empty room and draws S1. B joins and sees S1. A undoes, both
/// see an empty canvas. A draws S2, which replaces S1 for good.
#[tokio::test]
async fn test_join_undo_redraw_end_to_end() {
    let (url, _server) = start_test_server().await;

    let (a, mut a_events) = joined_client(&url, "r1", "A").await;
    a.draw_stroke(&stroke(1.0)).await.unwrap();
    let history = wait_revision(&a, 1).await;
    assert_eq!(history.len(), 1);

    let (b, _b_events) = joined_client(&url, "r1", "B").await;
    let roster: Vec<String> = b.roster().await.into_iter().map(|p| p.display_name).collect();
    assert_eq!(roster, vec!["A", "B"]);
    assert_eq!(wait_revision(&b, 1).await, history);

    a.undo().await.unwrap();
    assert!(wait_revision(&a, 2).await.is_empty());
    assert!(wait_revision(&b, 2).await.is_empty());

    a.draw_stroke(&stroke(2.0)).await.unwrap();
    let on_a = wait_revision(&a, 3).await;
    let on_b = wait_revision(&b, 3).await;
    assert_eq!(on_a, on_b);
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_a[0].stroke().unwrap().points[0], Vec2::new(2.0, 2.0));
    assert_eq!(on_a[0].sequence, 2);

    // S1 is gone: redo has nothing to restore
    a.redo().await.unwrap();
    a.ping(1).await.unwrap();
    wait_for(&mut a_events, |e| matches!(e, SyncEvent::Pong(1))).await;
    assert_eq!(a.revision().await, Some(3));
    assert_eq!(a.history().await, on_b);
}

#[tokio::test]
async fn test_concurrent_commits_converge() {
    let (url, _server) = start_test_server().await;
    let (a, _a_events) = joined_client(&url, "r1", "A").await;
    let (b, _b_events) = joined_client(&url, "r1", "B").await;

    let (sa, sb) = (stroke(1.0), stroke(5.0));
    let (ra, rb) = tokio::join!(a.draw_stroke(&sa), b.draw_stroke(&sb));
    ra.unwrap();
    rb.unwrap();

    let on_a = wait_revision(&a, 2).await;
    let on_b = wait_revision(&b, 2).await;
    assert_eq!(on_a.len(), 2);
    assert_eq!(on_a, on_b);
    assert!(on_a[0].sequence < on_a[1].sequence);
    assert_ne!(on_a[0].author, on_a[1].author);
}

#[tokio::test]
async fn test_undo_redo_reach_every_participant() {
    let (url, _server) = start_test_server().await;
    let (a, _a_events) = joined_client(&url, "r1", "A").await;
    let (b, _b_events) = joined_client(&url, "r1", "B").await;

    a.draw_stroke(&stroke(1.0)).await.unwrap();
    wait_revision(&b, 1).await;
    a.draw_stroke(&stroke(2.0)).await.unwrap();
    let full = wait_revision(&b, 2).await;

    // B undoes A's stroke: undo is room-wide
    b.undo().await.unwrap();
    assert_eq!(wait_revision(&a, 3).await.len(), 1);

    a.redo().await.unwrap();
    assert_eq!(wait_revision(&b, 4).await, full);
    assert_eq!(wait_revision(&a, 4).await, full);
}

#[tokio::test]
async fn test_unavailable_redo_sends_nothing() {
    let (url, _server) = start_test_server().await;
    let (a, mut events) = joined_client(&url, "r1", "A").await;

    a.redo().await.unwrap();
    a.undo().await.unwrap();
    a.ping(42).await.unwrap();

    // Nothing but the pong comes back
    let event = wait_for(&mut events, |e| {
        matches!(e, SyncEvent::Pong(_) | SyncEvent::HistoryChanged { .. })
    })
    .await;
    assert_eq!(event, SyncEvent::Pong(42));
    assert_eq!(a.revision().await, Some(0));
}

#[tokio::test]
async fn test_clear_is_undoable() {
    let (url, _server) = start_test_server().await;
    let (a, _events) = joined_client(&url, "r1", "A").await;

    a.draw_stroke(&stroke(1.0)).await.unwrap();
    a.clear().await.unwrap();
    let history = wait_revision(&a, 2).await;
    assert_eq!(history.len(), 2);
    assert!(history[1].is_clear());
    assert!(scribble_collab::effective_ops(&history).is_empty());

    a.undo().await.unwrap();
    let history = wait_revision(&a, 3).await;
    assert_eq!(scribble_collab::effective_ops(&history).len(), 1);
}

#[tokio::test]
async fn test_room_destroyed_after_last_leave() {
    let (url, server) = start_test_server().await;
    let (mut a, _events) = joined_client(&url, "r1", "A").await;
    a.draw_stroke(&stroke(1.0)).await.unwrap();
    wait_revision(&a, 1).await;
    assert_eq!(server.room_count().await, 1);

    a.disconnect().await;
    timeout(Duration::from_secs(2), async {
        while server.room_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room should be removed");

    let (c, _c_events) = joined_client(&url, "r1", "C").await;
    assert!(wait_revision(&c, 0).await.is_empty());
    let roster = c.roster().await;
    assert_eq!(roster.len(), 1);
    assert_eq!(Some(roster[0].id), c.self_id().await);
}

#[tokio::test]
async fn test_departure_notifies_remaining_participants() {
    let (url, server) = start_test_server().await;
    let (mut a, _a_events) = joined_client(&url, "r1", "A").await;
    let (b, mut b_events) = joined_client(&url, "r1", "B").await;
    let a_id = a.self_id().await.unwrap();

    a.disconnect().await;
    let event = wait_for(&mut b_events, |e| matches!(e, SyncEvent::ParticipantLeft(_))).await;
    assert_eq!(event, SyncEvent::ParticipantLeft(a_id));
    assert_eq!(b.roster().await.len(), 1);
    assert_eq!(server.participant_count("r1").await, 1);
}

#[tokio::test]
async fn test_full_room_rejects_join() {
    let (url, _server) = start_test_server_with(ServerConfig {
        max_participants_per_room: 1,
        ..ServerConfig::default()
    })
    .await;
    let (_a, _a_events) = joined_client(&url, "r1", "A").await;

    let mut b = SyncClient::new(&url);
    let mut events = b.take_event_rx().unwrap();
    b.connect().await.unwrap();
    b.join("r1", Some("B")).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, SyncEvent::JoinRejected(_))).await;
    assert_eq!(event, SyncEvent::JoinRejected(JoinRejection::RoomFull { capacity: 1 }));

    // Still unjoined, so another room works
    b.join("r2", Some("B")).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
}

#[tokio::test]
async fn test_blank_room_id_rejected() {
    let (url, server) = start_test_server().await;
    let mut client = SyncClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.join("   ", None).await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, SyncEvent::JoinRejected(_))).await;
    assert_eq!(event, SyncEvent::JoinRejected(JoinRejection::InvalidRoomId));
    assert_eq!(server.room_count().await, 0);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, _server) = start_test_server().await;
    let (a, _a_events) = joined_client(&url, "r1", "A").await;
    let (b, _b_events) = joined_client(&url, "r2", "B").await;

    a.draw_stroke(&stroke(1.0)).await.unwrap();
    wait_revision(&a, 1).await;
    b.ping(7).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.history().await.is_empty());
    assert_eq!(b.revision().await, Some(0));
}

#[tokio::test]
async fn test_explicit_sync_request() {
    let (url, _server) = start_test_server().await;
    let (a, _events) = joined_client(&url, "r1", "A").await;
    a.draw_stroke(&stroke(1.0)).await.unwrap();
    wait_revision(&a, 1).await;

    a.request_sync().await.unwrap();
    a.ping(9).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.is_synced().await);
    assert_eq!(a.history().await.len(), 1);
}

#[tokio::test]
async fn test_origin_allow_list() {
    let (url, server) = start_test_server_with(ServerConfig {
        allowed_origins: vec!["https://canvas.test".into()],
        ..ServerConfig::default()
    })
    .await;

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.test".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://canvas.test".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().await.rejected_handshakes, 1);
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let (url, server) = start_test_server().await;
    let (mut a, _events) = joined_client(&url, "r1", "A").await;
    a.ping(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages >= 2);

    a.disconnect().await;
    timeout(Duration::from_secs(2), async {
        while server.stats().await.active_connections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should be released");
    assert_eq!(server.stats().await.active_rooms, 0);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let port = free_port().await;
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    });
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{port}");
    assert!(tokio_tungstenite::connect_async(&url).await.is_ok());

    stop_tx.send(()).unwrap();
    let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

#[tokio::test]
async fn test_silent_connection_is_closed() {
    let (url, server) = start_test_server_with(ServerConfig {
        heartbeat_interval_secs: 1,
        idle_timeout_secs: 2,
        ..ServerConfig::default()
    })
    .await;

    // Joins, then never reads, so server pings go unanswered
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = FrameCodec::default()
        .encode(&ClientMessage::Join {
            room_id: "r1".into(),
            display_name: Some("Mute".into()),
        })
        .unwrap();
    ws.send(Message::Binary(join.into())).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while server.participant_count("r1").await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("join should land");

    timeout(Duration::from_secs(6), async {
        while server.participant_count("r1").await != 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("idle connection should be closed");

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.active_rooms, 0);
    drop(ws);
}

#[tokio::test]
async fn test_busy_room_keeps_responsive_clients() {
    let (url, server) = start_test_server_with(ServerConfig {
        heartbeat_interval_secs: 1,
        idle_timeout_secs: 2,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    })
    .await;
    let (a, _a_events) = joined_client(&url, "r1", "A").await;
    let (b, mut b_events) = joined_client(&url, "r1", "B").await;

    // Longer than the idle timeout
    let flood = async {
        for round in 0..70 {
            for _ in 0..20 {
                a.clear().await.unwrap();
            }
            b.ping(round).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            while b_events.try_recv().is_ok() {}
        }
    };
    flood.await;

    assert_eq!(server.participant_count("r1").await, 2);
    tokio::time::sleep(Duration::from_millis(200)).await;
    while b_events.try_recv().is_ok() {}
    b.ping(999).await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            match b_events.recv().await {
                Some(SyncEvent::Pong(999)) => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("b should still be served");
    assert_eq!(server.stats().await.active_connections, 2);
}

#[tokio::test]
async fn test_full_history_rejects_commits() {
    let (url, server) = start_test_server_with(ServerConfig {
        max_participants_per_room: 3,
        max_frame_bytes: 4096,
        ..ServerConfig::default()
    })
    .await;
    let (a, mut a_events) = joined_client(&url, "r1", "A").await;
    let (_b, mut b_events) = joined_client(&url, "r1", "B").await;

    for i in 0..100 {
        a.draw_stroke(&stroke(i as f32)).await.unwrap();
    }
    let rejected = wait_for(&mut a_events, |e| matches!(e, SyncEvent::CommitRejected(_))).await;
    assert!(matches!(
        rejected,
        SyncEvent::CommitRejected(CommitRejection::HistoryFull { .. })
    ));
    wait_for(&mut b_events, |e| matches!(e, SyncEvent::LiveStrokeCancelled { .. })).await;

    // A late joiner still receives the whole canvas
    a.ping(7).await.unwrap();
    wait_for(&mut a_events, |e| matches!(e, SyncEvent::Pong(7))).await;
    let committed = a.history().await.len();
    assert!(committed > 0 && committed < 100);
    let (c, _c_events) = joined_client(&url, "r1", "C").await;
    assert_eq!(c.history().await.len(), committed);
    assert_eq!(server.participant_count("r1").await, 3);
}
