// Collaboration service: wires the op-log store, submission pipeline,
// fan-out, session registry and presence tracker together and owns their
// background tasks.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tablesync_common::channel::Channel;
use tablesync_common::protocol::ws::{PresenceEntry, ServerMessage};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PubSubBackend, RelayConfig, DEFAULT_REDIS_PREFIX};
use crate::permissions::PermissionChecker;
use crate::presence::PresenceTracker;
use crate::pubsub::{
    Broker, Event, FanOut, LocalBus, PresenceAction, PublishError, Subscription, DIRECT_TOPIC,
};
use crate::store::OpLogStore;
use crate::sync::{DocLocks, SubmitPipeline};
use crate::ws::SessionManager;

const LOCK_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub connections: usize,
    pub channels: usize,
    pub presence_entries: usize,
    pub presence_resources: usize,
    pub document_locks: usize,
    pub fan_out: &'static str,
    pub store: &'static str,
}

pub struct CollaborationService {
    pipeline: SubmitPipeline,
    sessions: SessionManager,
    presence: PresenceTracker,
    fan_out: FanOut,
    locks: Arc<DocLocks>,
    sweep_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CollaborationService {
    /// Builds the service. Passing a broker selects distributed fan-out.
    pub fn new(
        config: &RelayConfig,
        store: OpLogStore,
        permissions: PermissionChecker,
        broker: Option<Broker>,
    ) -> Arc<Self> {
        let fan_out = match broker {
            Some(broker) => {
                let prefix = match &config.pubsub {
                    PubSubBackend::Redis { prefix, .. } => prefix.clone(),
                    PubSubBackend::Local => DEFAULT_REDIS_PREFIX.to_string(),
                };
                FanOut::distributed(broker, prefix, LocalBus::default())
            }
            None => FanOut::local(LocalBus::default()),
        };
        let locks = Arc::new(DocLocks::default());
        let pipeline =
            SubmitPipeline::new(store, permissions, fan_out.clone(), Arc::clone(&locks), config.submit);

        Arc::new(Self {
            pipeline,
            sessions: SessionManager::new(config.session),
            presence: PresenceTracker::new(config.presence.ttl),
            fan_out,
            locks,
            sweep_interval: config.presence.sweep_interval,
            tasks: Mutex::default(),
        })
    }

    pub fn pipeline(&self) -> &SubmitPipeline {
        &self.pipeline
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn fan_out(&self) -> &FanOut {
        &self.fan_out
    }

    /// Spawns direct-push delivery, the presence sweep, the idle lock prune
    /// and, when distributed, the broker reader.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = Vec::new();
        let direct = self.fan_out.subscribe(DIRECT_TOPIC);
        tasks.push(tokio::spawn(run_direct_delivery(Arc::downgrade(self), direct)));
        if let Some(reader) = self.fan_out.start().await {
            tasks.push(reader);
        }
        tasks.push(tokio::spawn(run_presence_sweep(Arc::downgrade(self), self.sweep_interval)));
        tasks.push(tokio::spawn(run_lock_prune(Arc::downgrade(self), LOCK_PRUNE_INTERVAL)));

        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(tasks);
        info!(fan_out = self.fan_out.backend_name(), store = self.pipeline.store().backend_name(), "collaboration service started");
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        tasks.iter().for_each(JoinHandle::abort);
        self.sessions.close_all().await;
        info!("collaboration service stopped");
    }

    /// Publishes a presence change on the channel the entry belongs to.
    pub async fn publish_presence(&self, action: PresenceAction, entry: PresenceEntry, origin: Option<Uuid>) {
        let Some(channel) = Channel::for_resource(&entry.resource_type, &entry.resource_id) else {
            warn!(resource_type = %entry.resource_type, resource_id = %entry.resource_id, "presence entry has no channel");
            return;
        };
        let topic = channel.to_string();
        let event = Event::Presence { action, entry, origin_connection: origin };
        if let Err(publish_error) = self.fan_out.publish(&topic, event).await {
            warn!(error = %publish_error, topic = %topic, "presence fan-out failed");
        }
    }

    /// Server-originated push to everyone on `channel`.
    pub async fn notify(&self, channel: &Channel, payload: Value) -> Result<(), PublishError> {
        self.fan_out.publish(&channel.to_string(), Event::Notification { payload }).await
    }

    /// Pushes `payload` to every connection `user_id` holds, on any instance.
    pub async fn notify_user(&self, user_id: &str, payload: Value) -> Result<(), PublishError> {
        let event = Event::Direct { user_id: Some(user_id.to_string()), payload };
        self.fan_out.publish(DIRECT_TOPIC, event).await
    }

    /// Pushes `payload` to every connection on every instance.
    pub async fn broadcast_system(&self, payload: Value) -> Result<(), PublishError> {
        self.fan_out.publish(DIRECT_TOPIC, Event::Direct { user_id: None, payload }).await
    }

    /// Queues a direct push on the matching local connections.
    async fn deliver_direct(&self, user_id: Option<&str>, payload: &Value) -> usize {
        let targets = match user_id {
            Some(user_id) => self.sessions.connections_for_user(user_id).await,
            None => self.sessions.all().await,
        };
        let mut delivered = 0;
        for connection in targets {
            match connection.send(ServerMessage::Notification(payload.clone())) {
                Ok(_) => delivered += 1,
                Err(reason) => debug!(connection_id = %connection.id(), %reason, "direct push skipped"),
            }
        }
        delivered
    }

    /// Evicts expired presence and announces each eviction.
    pub async fn sweep_presence(&self) -> usize {
        let expired = self.presence.sweep().await;
        let count = expired.len();
        for entry in expired {
            self.publish_presence(PresenceAction::Left, entry, None).await;
        }
        if count > 0 {
            debug!(evicted = count, "presence sweep");
        }
        count
    }

    pub async fn stats(&self) -> ServiceStats {
        let presence = self.presence.stats().await;
        ServiceStats {
            connections: self.sessions.connection_count().await,
            channels: self.sessions.channel_count().await,
            presence_entries: presence.entries,
            presence_resources: presence.resources,
            document_locks: self.locks.len(),
            fan_out: self.fan_out.backend_name(),
            store: self.pipeline.store().backend_name(),
        }
    }
}

async fn run_direct_delivery(service: Weak<CollaborationService>, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        if let Event::Direct { user_id, payload } = &*event {
            let delivered = service.deliver_direct(user_id.as_deref(), payload).await;
            debug!(user_id = user_id.as_deref().unwrap_or("*"), delivered, "direct push");
        }
    }
}

async fn run_presence_sweep(service: Weak<CollaborationService>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.reset();
    loop {
        interval.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        service.sweep_presence().await;
    }
}

async fn run_lock_prune(service: Weak<CollaborationService>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.reset();
    loop {
        interval.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        let pruned = service.locks.prune_idle();
        if pruned > 0 {
            debug!(pruned, "pruned idle document locks");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tablesync_common::channel::ResourceType;
    use tablesync_common::ot::{EditComponent, Operation};

    use super::*;
    use crate::config::PresenceConfig;

    fn config() -> RelayConfig {
        RelayConfig {
            presence: PresenceConfig { ttl: Duration::from_secs(5), sweep_interval: Duration::from_secs(1) },
            ..RelayConfig::default()
        }
    }

    fn entry(user: &str) -> PresenceEntry {
        PresenceEntry {
            resource_type: ResourceType::Record,
            resource_id: "t1:r1".into(),
            user_id: user.into(),
            connection_id: Uuid::new_v4(),
            cursor: None,
            metadata: json!({ "name": user }),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_announces_expired_presence() {
        let service = CollaborationService::new(&config(), OpLogStore::memory(), PermissionChecker::AllowAll, None);
        let mut subscription = service.fan_out().subscribe("record:t1:r1");
        service.presence().upsert(entry("u1"), None).await;

        service.start().await;
        tokio::time::advance(Duration::from_secs(7)).await;

        match &*subscription.recv().await.expect("left event") {
            Event::Presence { action, entry, .. } => {
                assert_eq!(*action, PresenceAction::Left);
                assert_eq!(entry.user_id, "u1");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(service.stats().await.presence_entries, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn notifications_reach_channel_subscribers() {
        let service = CollaborationService::new(&config(), OpLogStore::memory(), PermissionChecker::AllowAll, None);
        let mut subscription = service.fan_out().subscribe("table:t1");
        service.notify(&Channel::Table("t1".into()), json!({ "kind": "import_done" })).await.expect("notify");
        assert_eq!(
            *subscription.recv().await.expect("event"),
            Event::Notification { payload: json!({ "kind": "import_done" }) }
        );
    }

    async fn pushed(connection: &crate::ws::Connection) -> Option<ServerMessage> {
        match tokio::time::timeout(Duration::from_millis(200), connection.next_outbound()).await {
            Ok(crate::ws::Outbound::Message(message)) => Some(message),
            _ => None,
        }
    }

    #[tokio::test]
    async fn user_notifications_reach_only_that_users_connections() {
        let service = CollaborationService::new(&config(), OpLogStore::memory(), PermissionChecker::AllowAll, None);
        service.start().await;
        let laptop = service.sessions().register("u1", None).await.expect("register");
        let phone = service.sessions().register("u1", Some("s2".into())).await.expect("register");
        let other = service.sessions().register("u2", None).await.expect("register");

        service.notify_user("u1", json!({ "kind": "mention" })).await.expect("notify");
        for connection in [&laptop, &phone] {
            assert_eq!(pushed(connection).await, Some(ServerMessage::Notification(json!({ "kind": "mention" }))));
        }
        assert_eq!(pushed(&other).await, None);

        service.broadcast_system(json!({ "kind": "maintenance" })).await.expect("broadcast");
        for connection in [&laptop, &phone, &other] {
            assert_eq!(pushed(connection).await, Some(ServerMessage::Notification(json!({ "kind": "maintenance" }))));
        }
        service.shutdown().await;
    }

    #[tokio::test]
    async fn stats_report_backends_and_locks() {
        let service = CollaborationService::new(&config(), OpLogStore::memory(), PermissionChecker::AllowAll, None);
        let op = Operation::edit("rec_t1", "r1", 0, vec![EditComponent::set_field("a", json!(1))]);
        service.pipeline().submit("u1", op).await.expect("submit");

        let stats = service.stats().await;
        assert_eq!(stats.fan_out, "local");
        assert_eq!(stats.store, "memory");
        assert_eq!(stats.document_locks, 1);
        assert_eq!(stats.connections, 0);
    }

    #[tokio::test]
    async fn broker_selects_distributed_fan_out() {
        let service =
            CollaborationService::new(&config(), OpLogStore::memory(), PermissionChecker::AllowAll, Some(Broker::memory()));
        let mut subscription = service.fan_out().subscribe("table:t1");
        service.start().await;

        service.notify(&Channel::Table("t1".into()), json!(1)).await.expect("notify");
        assert_eq!(*subscription.recv().await.expect("event"), Event::Notification { payload: json!(1) });
        assert_eq!(service.stats().await.fan_out, "memory-broker");
        service.shutdown().await;
    }
}
