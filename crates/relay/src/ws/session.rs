use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use tablesync_common::channel::Channel;
use tablesync_common::protocol::ws::{
    CollaborationAction, CollaborationPayload, RecordChange, ServerMessage,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::outbound::{Outbound, OutboundQueue, PushOutcome, QueueError};
use crate::config::SessionConfig;
use crate::metrics;
use crate::pubsub::{Event, FanOut, PresenceAction, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Subscribed,
    Closing,
}

/// One registered WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    user_id: String,
    session_id: Option<String>,
    queue: OutboundQueue,
    closing: AtomicBool,
    subscriptions: Mutex<HashMap<Channel, JoinHandle<()>>>,
    /// Highest committed version sent per `(collection, document_id)`.
    delivered: Mutex<HashMap<(String, String), u64>>,
}

impl Connection {
    fn new(user_id: String, session_id: Option<String>, queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            session_id,
            queue: OutboundQueue::new(queue_capacity),
            closing: AtomicBool::new(false),
            subscriptions: Mutex::default(),
            delivered: Mutex::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        if self.closing.load(Ordering::Acquire) {
            ConnectionState::Closing
        } else if self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).is_empty() {
            ConnectionState::Open
        } else {
            ConnectionState::Subscribed
        }
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).contains_key(channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Queues a reply or push for the writer.
    pub fn send(&self, message: ServerMessage) -> Result<PushOutcome, QueueError> {
        let outcome = self.queue.push(message)?;
        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::QueuedAfterDrop(lost) | PushOutcome::Dropped(lost) => metrics::record_dropped_push(lost),
        }
        Ok(outcome)
    }

    pub async fn next_outbound(&self) -> Outbound {
        self.queue.next().await
    }

    /// Filters a dequeued message against what was already sent: commits at
    /// or below the last delivered version of their document are skipped,
    /// and a commit past the next expected version reports the gap.
    pub fn admit(&self, message: &ServerMessage) -> Admission {
        let (key, version) = match message {
            ServerMessage::RecordChange(change) => {
                ((change.collection.clone(), change.id.clone()), change.committed_version)
            }
            ServerMessage::Snapshot(payload) => {
                ((payload.collection.clone(), payload.snapshot.id.clone()), payload.snapshot.version)
            }
            _ => return Admission::Send,
        };

        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(message, ServerMessage::Snapshot(_)) {
            let last = delivered.entry(key).or_insert(0);
            *last = (*last).max(version);
            return Admission::Send;
        }

        // The first commit seen for a document sets its baseline.
        let Some(last) = delivered.get_mut(&key) else {
            delivered.insert(key, version);
            return Admission::Send;
        };
        if version <= *last {
            return Admission::Skip;
        }
        let previous = std::mem::replace(last, version);
        if version > previous + 1 {
            let (collection, document_id) = key;
            return Admission::FillGap { collection, document_id, after: previous, before: version };
        }
        Admission::Send
    }

    /// Turns a bus event seen on `channel` into a queued push.
    pub fn deliver(&self, channel: &Channel, event: &Event) -> Result<(), QueueError> {
        let message = match event {
            Event::Committed { collection, document_id, committed_version, operation } => {
                ServerMessage::RecordChange(RecordChange {
                    collection: collection.clone(),
                    id: document_id.clone(),
                    committed_version: *committed_version,
                    op: operation.clone(),
                })
            }
            Event::Presence { origin_connection: Some(origin), .. } if *origin == self.id => {
                return Ok(());
            }
            Event::Presence { action, entry, .. } => {
                ServerMessage::Collaboration(CollaborationPayload {
                    action: collaboration_action(*action),
                    channel: channel.clone(),
                    entry: Some(entry.clone()),
                    entries: Vec::new(),
                })
            }
            Event::Notification { payload } | Event::Direct { payload, .. } => {
                ServerMessage::Notification(payload.clone())
            }
        };
        self.send(message).map(|_| ())
    }

    /// Subscribes this connection to `channel`. Returns `false` when it
    /// already was.
    pub fn subscribe(self: &Arc<Self>, channel: Channel, fan_out: &FanOut) -> bool {
        match self.open_subscription(&channel, fan_out) {
            Some(subscription) => {
                self.start_forwarding(channel, subscription);
                true
            }
            None => false,
        }
    }

    /// Takes a bus subscription for `channel` without forwarding it yet, so
    /// replies queued before [`Connection::start_forwarding`] go out first.
    /// `None` when the connection already forwards that channel.
    pub fn open_subscription(&self, channel: &Channel, fan_out: &FanOut) -> Option<Subscription> {
        if self.is_subscribed(channel) {
            return None;
        }
        Some(fan_out.subscribe(&channel.to_string()))
    }

    /// Spawns the forwarder for a subscription from [`Connection::open_subscription`].
    pub fn start_forwarding(self: &Arc<Self>, channel: Channel, mut subscription: Subscription) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        if subscriptions.contains_key(&channel) || self.closing.load(Ordering::Acquire) {
            return;
        }

        let connection: Weak<Self> = Arc::downgrade(self);
        let forwarded = channel.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if let Err(reason) = connection.deliver(&forwarded, &event) {
                    debug!(connection_id = %connection.id, channel = %forwarded, %reason, "forwarder stopped");
                    break;
                }
            }
        });
        subscriptions.insert(channel, forwarder);
    }

    pub fn unsubscribe(&self, channel: &Channel) -> bool {
        let removed = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).remove(channel);
        match removed {
            Some(forwarder) => {
                forwarder.abort();
                true
            }
            None => false,
        }
    }

    /// Moves to `Closing`: forwarders stop and the queue rejects new pushes.
    pub fn begin_closing(&self) {
        self.closing.store(true, Ordering::Release);
        let forwarders: Vec<JoinHandle<()>> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, forwarder)| forwarder)
            .collect();
        forwarders.iter().for_each(JoinHandle::abort);
        self.queue.close(QueueError::Closing);
    }
}

/// What the writer does with a dequeued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Send,
    /// Already delivered.
    Skip,
    /// Send the commits in `(after, before)` from the log first, then this one.
    FillGap { collection: String, document_id: String, after: u64, before: u64 },
}

fn collaboration_action(action: PresenceAction) -> CollaborationAction {
    match action {
        PresenceAction::Joined => CollaborationAction::PresenceJoined,
        PresenceAction::Updated => CollaborationAction::PresenceUpdate,
        PresenceAction::Cursor => CollaborationAction::CursorUpdate,
        PresenceAction::Left => CollaborationAction::PresenceLeft,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection limit of {limit} reached")]
pub struct AdmissionError {
    pub limit: usize,
}

/// Registry of live connections on this instance.
#[derive(Debug)]
pub struct SessionManager {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self { connections: RwLock::default(), config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn has_capacity(&self) -> bool {
        self.connections.read().await.len() < self.config.max_connections
    }

    pub async fn register(
        &self,
        user_id: impl Into<String>,
        session_id: Option<String>,
    ) -> Result<Arc<Connection>, AdmissionError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.config.max_connections {
            return Err(AdmissionError { limit: self.config.max_connections });
        }
        let connection =
            Arc::new(Connection::new(user_id.into(), session_id, self.config.outbound_queue_capacity));
        connections.insert(connection.id(), Arc::clone(&connection));
        Ok(connection)
    }

    pub async fn unregister(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(&connection_id)
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    /// Every connection `user_id` has open on this instance.
    pub async fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| connection.user_id() == user_id)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Distinct channels with at least one member on this instance.
    pub async fn channel_count(&self) -> usize {
        let connections = self.connections.read().await;
        let channels: HashSet<Channel> =
            connections.values().flat_map(|connection| connection.channels()).collect();
        channels.len()
    }

    /// Closes every connection's queue; their writers then shut down.
    pub async fn close_all(&self) {
        for connection in self.connections.read().await.values() {
            connection.begin_closing();
        }
    }
}
