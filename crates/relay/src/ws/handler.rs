use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tablesync_common::channel::Channel;
use tablesync_common::protocol::ws::{
    decode_envelope, ClientMessage, CollaborationAction, CollaborationPayload, CursorUpdate,
    PresenceEntry, PresenceUpdate, RecordChange, ServerMessage, SnapshotPayload, SubmitPayload,
};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::outbound::{Outbound, QueueError};
use super::session::{Admission, Connection};
use super::{error_message, send_server_message};
use crate::collab::CollaborationService;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::metrics;
use crate::pubsub::PresenceAction;

const MAX_FRAME_BYTES: usize = 262_144;
const USER_ID_HEADER: &str = "x-user-id";
const SESSION_ID_HEADER: &str = "x-session-id";
const SLOW_CONSUMER_REASON: &str = "slow consumer";

#[derive(Debug, Default, Deserialize)]
pub struct WsIdentityQuery {
    user_id: Option<String>,
    session_id: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Identity is established upstream; the relay only reads it.
fn identity(headers: &HeaderMap, query: WsIdentityQuery) -> Option<(String, Option<String>)> {
    let user_id = header_value(headers, USER_ID_HEADER)
        .or(query.user_id.filter(|value| !value.trim().is_empty()))?;
    let session_id = header_value(headers, SESSION_ID_HEADER).or(query.session_id);
    Some((user_id, session_id))
}

pub async fn ws_upgrade(
    State(service): State<Arc<CollaborationService>>,
    Query(query): Query<WsIdentityQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some((user_id, session_id)) = identity(&headers, query) else {
        return RelayError::from_code(ErrorCode::AuthRequired).into_response();
    };
    if !service.sessions().has_capacity().await {
        return RelayError::from_code(ErrorCode::TooManyConnections).into_response();
    }

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(service, user_id, session_id, socket)).await;
    })
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
        .await;
}

async fn handle_socket(
    service: Arc<CollaborationService>,
    user_id: String,
    session_id: Option<String>,
    mut socket: WebSocket,
) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());

    // Capacity may have been taken between the upgrade check and now.
    let connection = match service.sessions().register(user_id, session_id).await {
        Ok(connection) => connection,
        Err(admission) => {
            let error = RelayError::new(ErrorCode::TooManyConnections, admission.to_string());
            let _ = send_server_message(&mut socket, &error_message(&error)).await;
            close_with(&mut socket, close_code::AGAIN, ErrorCode::TooManyConnections.as_str()).await;
            return;
        }
    };
    metrics::adjust_ws_connections(1);
    info!(
        connection_id = %connection.id(),
        user_id = %connection.user_id(),
        session_id = connection.session_id().unwrap_or(""),
        request_id = %request_id,
        "websocket connected"
    );

    let session_config = *service.sessions().config();
    let mut heartbeat_interval = tokio::time::interval(session_config.heartbeat_interval);
    heartbeat_interval.reset();
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if missed_pongs >= session_config.max_missed_pongs {
                    warn!(connection_id = %connection.id(), missed_pongs, "heartbeat timeout, disconnecting");
                    break;
                }
                missed_pongs += 1;
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            outbound = connection.next_outbound() => {
                match outbound {
                    Outbound::Message(message) => {
                        let mut failed = false;
                        for outgoing in admitted(&service, &connection, message).await {
                            if send_server_message(&mut socket, &outgoing).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Outbound::Close(QueueError::SlowConsumer) => {
                        metrics::increment_slow_consumer_closes();
                        warn!(connection_id = %connection.id(), "outbound queue overflowed, closing slow consumer");
                        close_with(&mut socket, close_code::POLICY, SLOW_CONSUMER_REASON).await;
                        break;
                    }
                    Outbound::Close(QueueError::Closing) => {
                        close_with(&mut socket, close_code::AWAY, "server shutting down").await;
                        break;
                    }
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_with(&mut socket, close_code::SIZE, "websocket frame too large").await;
                            break;
                        }
                        match decode_client_message(raw_message.as_str()) {
                            Ok(ClientMessage::Pong) => {
                                metrics::record_ws_message("pong", false);
                                missed_pongs = 0;
                            }
                            Ok(inbound) => {
                                let replies = handle_client_message(&service, &connection, inbound).await;
                                if enqueue_all(&connection, replies).is_err() {
                                    // The writer arm picks up the close reason.
                                    continue;
                                }
                            }
                            Err(error_reply) => {
                                metrics::record_ws_message("invalid", true);
                                if send_server_message(&mut socket, &error_reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        missed_pongs = 0;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_with(&mut socket, close_code::SIZE, "websocket frame too large").await;
                        }
                        break;
                    }
                }
            }
        }
    }

    release_connection(&service, &connection).await;
}

/// What the writer actually sends for one dequeued message: nothing for a
/// duplicate, or the commits missing from the log ahead of a version jump.
pub(crate) async fn admitted(
    service: &CollaborationService,
    connection: &Connection,
    message: ServerMessage,
) -> Vec<ServerMessage> {
    match connection.admit(&message) {
        Admission::Send => vec![message],
        Admission::Skip => Vec::new(),
        Admission::FillGap { collection, document_id, after, before } => {
            let mut outgoing = match service.pipeline().ops(&collection, &document_id, after, before - 1).await {
                Ok(missing) => missing
                    .into_iter()
                    .map(|committed| {
                        ServerMessage::RecordChange(RecordChange {
                            collection: collection.clone(),
                            id: document_id.clone(),
                            committed_version: committed.committed_version,
                            op: committed.operation,
                        })
                    })
                    .collect(),
                Err(error) => {
                    warn!(connection_id = %connection.id(), %collection, %document_id, after, before, %error, "could not fill commit gap");
                    Vec::new()
                }
            };
            debug!(connection_id = %connection.id(), %collection, %document_id, filled = outgoing.len(), "filled commit gap");
            outgoing.push(message);
            outgoing
        }
    }
}

fn enqueue_all(connection: &Connection, replies: Vec<ServerMessage>) -> Result<(), QueueError> {
    for reply in replies {
        connection.send(reply)?;
    }
    Ok(())
}

fn decode_client_message(raw: &str) -> Result<ClientMessage, ServerMessage> {
    let invalid = |detail: String| {
        ServerMessage::error(ErrorCode::ValidationFailed.as_str(), detail, false)
    };
    let envelope = decode_envelope(raw).map_err(|error| invalid(format!("invalid websocket frame: {error}")))?;
    let message_type = envelope.message_type.clone();
    ClientMessage::from_envelope(envelope)
        .map_err(|error| invalid(format!("invalid `{message_type}` payload: {error}")))
}

/// Dispatches one decoded client message and returns the direct replies.
pub(crate) async fn handle_client_message(
    service: &Arc<CollaborationService>,
    connection: &Arc<Connection>,
    message: ClientMessage,
) -> Vec<ServerMessage> {
    let started_at = Instant::now();
    let (label, result) = match message {
        ClientMessage::JoinChannel(request) => {
            ("join_channel", handle_join_channel(service, connection, request.channel).await)
        }
        ClientMessage::LeaveChannel(request) => {
            ("leave_channel", handle_leave_channel(service, connection, request.channel).await)
        }
        ClientMessage::PresenceUpdate(update) => {
            ("presence_update", handle_presence_update(service, connection, update).await)
        }
        ClientMessage::CursorUpdate(update) => {
            ("cursor_update", handle_cursor_update(service, connection, update).await)
        }
        ClientMessage::Ping => ("ping", Ok(vec![ServerMessage::Pong])),
        ClientMessage::Pong => ("pong", Ok(Vec::new())),
        ClientMessage::Submit(payload) => {
            spawn_submit(Arc::clone(service), Arc::clone(connection), payload);
            ("submit", Ok(Vec::new()))
        }
        ClientMessage::Unknown { received_type } => {
            debug!(connection_id = %connection.id(), %received_type, "unknown websocket message type");
            ("unknown", Ok(vec![ServerMessage::UnknownMessage { received_type }]))
        }
    };

    metrics::record_ws_message(label, result.is_err());
    debug!(
        connection_id = %connection.id(),
        message_type = label,
        latency_ms = started_at.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "websocket message handled"
    );
    result.unwrap_or_else(|error_reply| vec![error_reply])
}

/// Queues `channel_joined`, the snapshot for document channels and the
/// presence list, then starts forwarding. The bus subscription is taken
/// before the snapshot load so no later commit is missed, and anything it
/// buffered is queued behind the join replies.
pub(crate) async fn handle_join_channel(
    service: &CollaborationService,
    connection: &Arc<Connection>,
    channel: Channel,
) -> Result<Vec<ServerMessage>, ServerMessage> {
    let subscription = connection.open_subscription(&channel, service.fan_out());

    let mut replies =
        vec![ServerMessage::ChannelJoined { channel: channel.clone(), connection_id: connection.id() }];
    if let Some((collection, document_id)) = channel.document() {
        let snapshot = service
            .pipeline()
            .snapshot(&collection, &document_id)
            .await
            .map_err(|error| error_message(&RelayError::from(error)))?;
        replies.push(ServerMessage::Snapshot(SnapshotPayload { channel: channel.clone(), collection, snapshot }));
    }

    let entries = service.presence().list(&channel.resource_type(), &channel.resource_id()).await;
    replies.push(ServerMessage::Collaboration(CollaborationPayload {
        action: CollaborationAction::PresenceList,
        channel: channel.clone(),
        entry: None,
        entries,
    }));

    if enqueue_all(connection, replies).is_err() {
        // The writer arm picks up the close reason.
        return Ok(Vec::new());
    }
    if let Some(subscription) = subscription {
        connection.start_forwarding(channel, subscription);
    }
    Ok(Vec::new())
}

pub(crate) async fn handle_leave_channel(
    service: &CollaborationService,
    connection: &Connection,
    channel: Channel,
) -> Result<Vec<ServerMessage>, ServerMessage> {
    connection.unsubscribe(&channel);
    let removed = service
        .presence()
        .remove_entry(connection.id(), connection.user_id(), &channel.resource_type(), &channel.resource_id())
        .await;
    if let Some(entry) = removed {
        service.publish_presence(PresenceAction::Left, entry, Some(connection.id())).await;
    }
    Ok(vec![ServerMessage::ChannelLeft { channel }])
}

fn require_membership(connection: &Connection, channel: &Channel) -> Result<(), ServerMessage> {
    if connection.is_subscribed(channel) {
        Ok(())
    } else {
        Err(ServerMessage::error(
            ErrorCode::ValidationFailed.as_str(),
            format!("join {channel} before updating presence on it"),
            false,
        ))
    }
}

async fn current_entry(service: &CollaborationService, connection: &Connection, channel: &Channel) -> PresenceEntry {
    let resource_type = channel.resource_type();
    let resource_id = channel.resource_id();
    match service.presence().get(connection.id(), connection.user_id(), &resource_type, &resource_id).await {
        Some(existing) => existing,
        None => PresenceEntry {
            resource_type,
            resource_id,
            user_id: connection.user_id().to_string(),
            connection_id: connection.id(),
            cursor: None,
            metadata: Value::Null,
            last_seen: Utc::now(),
        },
    }
}

pub(crate) async fn handle_presence_update(
    service: &CollaborationService,
    connection: &Connection,
    update: PresenceUpdate,
) -> Result<Vec<ServerMessage>, ServerMessage> {
    require_membership(connection, &update.channel)?;
    let mut entry = current_entry(service, connection, &update.channel).await;
    entry.metadata = update.metadata;

    let is_new = service.presence().upsert(entry.clone(), None).await;
    let action = if is_new { PresenceAction::Joined } else { PresenceAction::Updated };
    service.publish_presence(action, entry, Some(connection.id())).await;
    Ok(Vec::new())
}

pub(crate) async fn handle_cursor_update(
    service: &CollaborationService,
    connection: &Connection,
    update: CursorUpdate,
) -> Result<Vec<ServerMessage>, ServerMessage> {
    require_membership(connection, &update.channel)?;
    let mut entry = current_entry(service, connection, &update.channel).await;
    entry.cursor = Some(update.cursor);

    let is_new = service.presence().upsert(entry.clone(), None).await;
    let action = if is_new { PresenceAction::Joined } else { PresenceAction::Cursor };
    service.publish_presence(action, entry, Some(connection.id())).await;
    Ok(Vec::new())
}

/// Submissions run off the read loop; the ack or error is queued when done.
fn spawn_submit(service: Arc<CollaborationService>, connection: Arc<Connection>, payload: SubmitPayload) {
    let SubmitPayload { collection, id, op: mut operation } = payload;
    operation.collection = collection.clone();
    operation.document_id = id.clone();
    if operation.source.is_empty() {
        operation.source = connection.id().to_string();
    }

    let span = info_span!("tablesync.ws.submit", connection_id = %connection.id(), collection = %collection, document_id = %id);
    tokio::spawn(
        async move {
            let reply = match service.pipeline().submit(connection.user_id(), operation).await {
                Ok(outcome) => ServerMessage::SubmitAck {
                    collection,
                    id,
                    committed_version: outcome.committed_version,
                },
                Err(submit_error) => error_message(&RelayError::from(submit_error)),
            };
            if let Err(reason) = connection.send(reply) {
                debug!(%reason, "submit reply dropped, connection is closing");
            }
        }
        .instrument(span),
    );
}

/// Tears a connection down: forwarders stop, owned presence is removed and
/// announced, and the registry forgets it.
pub(crate) async fn release_connection(service: &CollaborationService, connection: &Connection) {
    let state = connection.state();
    connection.begin_closing();

    let removed = service.presence().remove_connection(connection.id()).await;
    for entry in removed {
        service.publish_presence(PresenceAction::Left, entry, Some(connection.id())).await;
    }

    service.sessions().unregister(connection.id()).await;
    metrics::adjust_ws_connections(-1);
    info!(connection_id = %connection.id(), state_at_close = ?state, "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use serde_json::json;
    use tablesync_common::channel::ResourceType;
    use tablesync_common::ot::{EditComponent, Operation};
    use tablesync_common::protocol::ws::{ChannelRequest, CursorPosition};

    use super::*;
    use crate::config::RelayConfig;
    use crate::permissions::PermissionChecker;
    use crate::pubsub::Event;
    use crate::store::OpLogStore;

    fn service() -> Arc<CollaborationService> {
        CollaborationService::new(&RelayConfig::default(), OpLogStore::memory(), PermissionChecker::AllowAll, None)
    }

    fn record_channel() -> Channel {
        "record:t1:r1".parse().expect("channel")
    }

    async fn next_message(connection: &Connection) -> ServerMessage {
        match connection.next_outbound().await {
            Outbound::Message(message) => message,
            other => panic!("unexpected outbound {other:?}"),
        }
    }

    #[test]
    fn identity_prefers_headers_then_query() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u-header"));
        let query = WsIdentityQuery { user_id: Some("u-query".into()), session_id: Some("s1".into()) };
        assert_eq!(identity(&headers, query), Some(("u-header".to_string(), Some("s1".to_string()))));

        let query = WsIdentityQuery { user_id: Some("u-query".into()), session_id: None };
        assert_eq!(identity(&HeaderMap::new(), query), Some(("u-query".to_string(), None)));

        let blank = WsIdentityQuery { user_id: Some("  ".into()), session_id: None };
        assert_eq!(identity(&HeaderMap::new(), blank), None);
    }

    #[test]
    fn malformed_frames_become_validation_errors() {
        let reply = decode_client_message("not json").expect_err("invalid frame");
        assert!(matches!(reply, ServerMessage::Error(ref payload) if payload.code == "VALIDATION_FAILED"));

        let reply = decode_client_message(r#"{"type":"join_channel","data":{"channel":"bogus"}}"#)
            .expect_err("bad channel");
        assert!(matches!(reply, ServerMessage::Error(_)));
    }

    #[tokio::test]
    async fn join_replays_snapshot_and_presence() {
        let service = service();
        let op = Operation::edit("rec_t1", "r1", 0, vec![EditComponent::set_field("a", json!(1))]);
        service.pipeline().submit("u0", op).await.expect("seed");

        let connection = service.sessions().register("u1", None).await.expect("register");
        let replies = handle_client_message(
            &service,
            &connection,
            ClientMessage::JoinChannel(ChannelRequest { channel: record_channel() }),
        )
        .await;
        assert!(replies.is_empty(), "join replies are queued directly");

        let joined = next_message(&connection).await;
        assert!(matches!(&joined, ServerMessage::ChannelJoined { connection_id, .. } if *connection_id == connection.id()));
        match next_message(&connection).await {
            ServerMessage::Snapshot(payload) => {
                assert_eq!(payload.collection, "rec_t1");
                assert_eq!(payload.snapshot.version, 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(matches!(
            next_message(&connection).await,
            ServerMessage::Collaboration(payload) if payload.action == CollaborationAction::PresenceList
        ));
        assert!(connection.is_subscribed(&record_channel()));
    }

    #[tokio::test]
    async fn table_join_has_no_snapshot() {
        let service = service();
        let connection = service.sessions().register("u1", None).await.expect("register");
        handle_join_channel(&service, &connection, Channel::Table("t1".into())).await.expect("join");
        assert!(matches!(next_message(&connection).await, ServerMessage::ChannelJoined { .. }));
        assert!(matches!(next_message(&connection).await, ServerMessage::Collaboration(_)));
    }

    #[tokio::test]
    async fn commits_racing_a_join_arrive_after_its_replies() {
        let service = service();
        let connection = service.sessions().register("u1", None).await.expect("register");

        // Hold the store so the join stalls on its snapshot load.
        let OpLogStore::Memory(store) = service.pipeline().store() else {
            panic!("memory store expected");
        };
        let held = store.write().await;
        let join = {
            let service = Arc::clone(&service);
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { handle_join_channel(&service, &connection, record_channel()).await })
        };
        while service.fan_out().bus().subscriber_count("record:t1:r1") == 0 {
            tokio::task::yield_now().await;
        }

        let commit = Event::Committed {
            collection: "rec_t1".into(),
            document_id: "r1".into(),
            committed_version: 1,
            operation: Operation::edit("rec_t1", "r1", 0, vec![EditComponent::set_field("a", json!(1))]),
        };
        service.fan_out().publish("record:t1:r1", commit).await.expect("publish");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);
        join.await.expect("join task").expect("join");

        assert!(matches!(next_message(&connection).await, ServerMessage::ChannelJoined { .. }));
        assert!(matches!(next_message(&connection).await, ServerMessage::Snapshot(_)));
        assert!(matches!(next_message(&connection).await, ServerMessage::Collaboration(_)));
        assert!(matches!(
            next_message(&connection).await,
            ServerMessage::RecordChange(change) if change.committed_version == 1
        ));
    }

    #[tokio::test]
    async fn version_jump_is_filled_from_the_log() {
        let service = service();
        for version in 0..4 {
            let op = Operation::edit("rec_t1", "r1", version, vec![EditComponent::set_field("n", json!(version))]);
            service.pipeline().submit("u0", op).await.expect("commit");
        }
        let connection = service.sessions().register("u1", None).await.expect("register");
        let log = service.pipeline().ops("rec_t1", "r1", 0, 0).await.expect("log");
        let change = |version: u64| {
            let committed = &log[version as usize - 1];
            ServerMessage::RecordChange(RecordChange {
                collection: "rec_t1".into(),
                id: "r1".into(),
                committed_version: committed.committed_version,
                op: committed.operation.clone(),
            })
        };

        assert_eq!(admitted(&service, &connection, change(1)).await, vec![change(1)]);
        assert_eq!(admitted(&service, &connection, change(4)).await, vec![change(2), change(3), change(4)]);
        assert!(admitted(&service, &connection, change(3)).await.is_empty());
    }

    #[tokio::test]
    async fn presence_requires_membership_and_is_published_to_others() {
        let service = service();
        let author = service.sessions().register("u1", None).await.expect("register");
        let watcher = service.sessions().register("u2", None).await.expect("register");

        let update = PresenceUpdate { channel: record_channel(), metadata: json!({ "name": "Ada" }) };
        let rejected = handle_presence_update(&service, &author, update.clone()).await;
        assert!(rejected.is_err());

        handle_join_channel(&service, &author, record_channel()).await.expect("join");
        handle_join_channel(&service, &watcher, record_channel()).await.expect("join");
        for _ in 0..3 {
            next_message(&watcher).await;
        }
        handle_presence_update(&service, &author, update).await.expect("presence");
        let cursor = CursorUpdate {
            channel: record_channel(),
            cursor: CursorPosition { record_id: Some("r1".into()), field_id: Some("f1".into()) },
        };
        handle_cursor_update(&service, &author, cursor).await.expect("cursor");

        let joined = next_message(&watcher).await;
        assert!(matches!(
            &joined,
            ServerMessage::Collaboration(payload)
                if payload.action == CollaborationAction::PresenceJoined
                    && payload.entry.as_ref().map(|e| e.user_id.as_str()) == Some("u1")
        ));
        match next_message(&watcher).await {
            ServerMessage::Collaboration(payload) => {
                assert_eq!(payload.action, CollaborationAction::CursorUpdate);
                let entry = payload.entry.expect("entry");
                assert_eq!(entry.metadata, json!({ "name": "Ada" }));
                assert_eq!(entry.cursor.and_then(|c| c.field_id).as_deref(), Some("f1"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // The author receives no echo of their own updates.
        assert_eq!(author.state(), crate::ws::ConnectionState::Subscribed);
        let listed = service.presence().list(&ResourceType::Record, "t1:r1").await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn leave_and_release_announce_departure() {
        let service = service();
        let mut observer = service.fan_out().subscribe("record:t1:r1");
        let connection = service.sessions().register("u1", None).await.expect("register");
        handle_join_channel(&service, &connection, record_channel()).await.expect("join");
        let update = PresenceUpdate { channel: record_channel(), metadata: Value::Null };
        handle_presence_update(&service, &connection, update).await.expect("presence");

        let replies = handle_leave_channel(&service, &connection, record_channel()).await.expect("leave");
        assert_eq!(replies, vec![ServerMessage::ChannelLeft { channel: record_channel() }]);

        let mut actions = Vec::new();
        for _ in 0..2 {
            if let Event::Presence { action, .. } = &*observer.recv().await.expect("event") {
                actions.push(*action);
            }
        }
        assert_eq!(actions, vec![PresenceAction::Joined, PresenceAction::Left]);

        handle_join_channel(&service, &connection, Channel::Table("t1".into())).await.expect("join");
        release_connection(&service, &connection).await;
        assert_eq!(service.sessions().connection_count().await, 0);
        assert_eq!(service.presence().stats().await.entries, 0);
    }

    #[tokio::test]
    async fn submit_acks_through_the_queue() {
        let service = service();
        let connection = service.sessions().register("u1", None).await.expect("register");
        let payload = SubmitPayload {
            collection: "rec_t1".into(),
            id: "r1".into(),
            op: Operation::edit("", "", 0, vec![EditComponent::set_field("a", json!(1))]),
        };
        handle_client_message(&service, &connection, ClientMessage::Submit(payload)).await;

        assert_eq!(
            next_message(&connection).await,
            ServerMessage::SubmitAck { collection: "rec_t1".into(), id: "r1".into(), committed_version: 1 }
        );

        let stale = SubmitPayload {
            collection: "rec_t1".into(),
            id: "r1".into(),
            op: Operation::edit("", "", 9, vec![EditComponent::set_field("a", json!(2))]),
        };
        handle_client_message(&service, &connection, ClientMessage::Submit(stale)).await;
        assert!(matches!(
            next_message(&connection).await,
            ServerMessage::Error(payload) if payload.code == "INVALID_VERSION" && !payload.retryable
        ));
    }

    #[tokio::test]
    async fn ping_and_unknown_messages_get_direct_replies() {
        let service = service();
        let connection = service.sessions().register("u1", None).await.expect("register");
        assert_eq!(handle_client_message(&service, &connection, ClientMessage::Ping).await, vec![ServerMessage::Pong]);
        assert_eq!(
            handle_client_message(&service, &connection, ClientMessage::Unknown { received_type: "record_change".into() })
                .await,
            vec![ServerMessage::UnknownMessage { received_type: "record_change".into() }]
        );
    }
}
