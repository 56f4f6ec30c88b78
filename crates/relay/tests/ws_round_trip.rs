use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tablesync_relay::app::build_router;
use tablesync_relay::collab::CollaborationService;
use tablesync_relay::config::{RelayConfig, SessionConfig};
use tablesync_relay::permissions::PermissionChecker;
use tablesync_relay::store::OpLogStore;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (SocketAddr, Arc<CollaborationService>) {
    serve_with(RelayConfig::default()).await
}

async fn serve_with(config: RelayConfig) -> (SocketAddr, Arc<CollaborationService>) {
    let service = CollaborationService::new(&config, OpLogStore::memory(), PermissionChecker::AllowAll, None);
    service.start().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = build_router(Arc::clone(&service), None);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    (addr, service)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws?user_id={user}")).await.expect("ws handshake");
    client
}

async fn send(client: &mut Client, message_type: &str, data: Value) {
    let envelope = json!({ "type": message_type, "data": data, "timestamp": "2026-03-01T12:00:00Z" });
    client.send(Message::text(envelope.to_string())).await.expect("send frame");
}

/// Reads envelopes until one of `message_type` arrives, returning it and
/// everything skipped on the way.
async fn expect_type(client: &mut Client, message_type: &str) -> (Value, Vec<Value>) {
    let mut skipped = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {message_type}; saw {skipped:?}"))
            .expect("stream open")
            .expect("frame");
        let Message::Text(text) = frame else {
            continue;
        };
        let envelope: Value = serde_json::from_str(text.as_str()).expect("envelope json");
        if envelope["type"] == message_type {
            return (envelope, skipped);
        }
        skipped.push(envelope);
    }
}

async fn expect_collaboration(client: &mut Client, action: &str) -> Value {
    loop {
        let (message, _) = expect_type(client, "collaboration").await;
        if message["data"]["action"] == action {
            return message;
        }
    }
}

#[tokio::test]
async fn join_submit_and_presence_round_trip() {
    let (addr, service) = serve().await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;

    for client in [&mut alice, &mut bob] {
        send(client, "join_channel", json!({ "channel": "record:t1:r1" })).await;
        let (joined, _) = expect_type(client, "channel_joined").await;
        assert_eq!(joined["data"]["channel"], "record:t1:r1");
        let (snapshot, _) = expect_type(client, "snapshot").await;
        assert_eq!(snapshot["data"]["version"], 0);
        let (presence, _) = expect_type(client, "collaboration").await;
        assert_eq!(presence["data"]["action"], "presence_list");
    }

    send(
        &mut alice,
        "submit",
        json!({
            "collection": "rec_t1",
            "id": "r1",
            "op": { "v": 0, "op": [{ "p": ["status"], "oi": "open" }] }
        }),
    )
    .await;

    let (ack, _) = expect_type(&mut alice, "submit_ack").await;
    assert_eq!(ack["data"]["committed_version"], 1);
    let (change, _) = expect_type(&mut bob, "record_change").await;
    assert_eq!(change["data"]["collection"], "rec_t1");
    assert_eq!(change["data"]["committed_version"], 1);

    send(&mut bob, "presence_update", json!({ "channel": "record:t1:r1", "metadata": { "name": "Bob" } })).await;
    let joined = expect_collaboration(&mut alice, "presence_joined").await;
    assert_eq!(joined["data"]["entry"]["metadata"]["name"], "Bob");

    send(&mut bob, "cursor_update", json!({ "channel": "record:t1:r1", "cursor": { "field_id": "status" } })).await;
    let cursor = expect_collaboration(&mut alice, "cursor_update").await;
    assert_eq!(cursor["data"]["entry"]["user_id"], "bob");
    assert_eq!(cursor["data"]["entry"]["cursor"]["field_id"], "status");
    assert_eq!(cursor["data"]["entry"]["metadata"]["name"], "Bob", "cursor moves keep metadata");

    send(&mut alice, "ping", json!({})).await;
    expect_type(&mut alice, "pong").await;

    send(&mut alice, "made_up", json!({})).await;
    let (unknown, _) = expect_type(&mut alice, "unknown_message").await;
    assert_eq!(unknown["data"]["received_type"], "made_up");

    assert_eq!(service.stats().await.connections, 2);
    bob.close(None).await.expect("close bob");
    let left = expect_collaboration(&mut alice, "presence_left").await;
    assert_eq!(left["data"]["entry"]["user_id"], "bob");

    service.shutdown().await;
}

#[tokio::test]
async fn upgrade_without_identity_is_rejected() {
    let (addr, service) = serve().await;
    let error = connect_async(format!("ws://{addr}/ws")).await.expect_err("handshake should fail");
    match error {
        tokio_tungstenite::tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("unexpected handshake error {other:?}"),
    }
    service.shutdown().await;
}

#[tokio::test]
async fn presence_on_an_unjoined_channel_is_a_validation_error() {
    let (addr, service) = serve().await;
    let mut client = connect(addr, "carol").await;

    send(&mut client, "presence_update", json!({ "channel": "table:t9", "metadata": { "name": "Carol" } })).await;
    let (error, _) = expect_type(&mut client, "error").await;
    assert_eq!(error["data"]["code"], "VALIDATION_FAILED");
    assert_eq!(error["data"]["retryable"], false);

    service.shutdown().await;
}

#[tokio::test]
async fn unanswered_pings_close_the_connection_and_drop_presence() {
    let config = RelayConfig {
        session: SessionConfig {
            heartbeat_interval: Duration::from_millis(50),
            max_missed_pongs: 1,
            ..SessionConfig::default()
        },
        ..RelayConfig::default()
    };
    let (addr, service) = serve_with(config).await;
    let mut silent = connect(addr, "dave").await;

    // Only writes from here on: an unread client never answers a ping.
    send(&mut silent, "join_channel", json!({ "channel": "record:t1:r1" })).await;
    send(&mut silent, "presence_update", json!({ "channel": "record:t1:r1", "metadata": { "name": "Dave" } })).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while service.presence().stats().await.entries == 0 {
        assert!(tokio::time::Instant::now() < deadline, "presence never registered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    while service.sessions().connection_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "heartbeat never closed the socket");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.presence().stats().await.entries, 0);

    // The server side is gone: the stream ends once the buffered frames drain.
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match silent.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client stream should end after the heartbeat close");

    service.shutdown().await;
}
