// Presence and cursor tracking.
//
// Expiry is lazy on read plus a periodic sweep; there are no per-entry
// timers. Ages use tokio's clock so tests can pause time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tablesync_common::channel::ResourceType;
use tablesync_common::protocol::ws::PresenceEntry;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

type ResourceKey = (ResourceType, String);
type EntryKey = (String, Uuid);

#[derive(Debug, Clone)]
struct TrackedEntry {
    entry: PresenceEntry,
    refreshed_at: Instant,
    ttl: Duration,
}

impl TrackedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.refreshed_at) >= self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PresenceStats {
    pub entries: usize,
    pub resources: usize,
}

/// Who is on which resource, keyed `(resource_type, resource_id)` then
/// `(user_id, connection_id)`.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    state: Arc<RwLock<HashMap<ResourceKey, HashMap<EntryKey, TrackedEntry>>>>,
    default_ttl: Duration,
}

impl PresenceTracker {
    pub fn new(default_ttl: Duration) -> Self {
        Self { state: Arc::default(), default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Inserts or refreshes `entry`. Returns `true` when it was not present
    /// (or had already expired).
    pub async fn upsert(&self, mut entry: PresenceEntry, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        entry.last_seen = Utc::now();
        let resource = (entry.resource_type.clone(), entry.resource_id.clone());
        let key = (entry.user_id.clone(), entry.connection_id);

        let mut guard = self.state.write().await;
        let entries = guard.entry(resource).or_default();
        let is_new = entries.get(&key).map_or(true, |existing| existing.is_expired(now));
        entries.insert(key, TrackedEntry { entry, refreshed_at: now, ttl: ttl.unwrap_or(self.default_ttl) });
        is_new
    }

    /// Removes every connection's entry for `user_id` on the resource.
    pub async fn remove(
        &self,
        user_id: &str,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Vec<PresenceEntry> {
        let mut guard = self.state.write().await;
        let resource = (resource_type.clone(), resource_id.to_string());
        let Some(entries) = guard.get_mut(&resource) else {
            return Vec::new();
        };
        let keys: Vec<EntryKey> =
            entries.keys().filter(|(user, _)| user == user_id).cloned().collect();
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .map(|tracked| tracked.entry)
            .collect();
        if entries.is_empty() {
            guard.remove(&resource);
        }
        removed
    }

    /// Removes one connection's entry on a single resource.
    pub async fn remove_entry(
        &self,
        connection_id: Uuid,
        user_id: &str,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Option<PresenceEntry> {
        let mut guard = self.state.write().await;
        let resource = (resource_type.clone(), resource_id.to_string());
        let entries = guard.get_mut(&resource)?;
        let removed = entries.remove(&(user_id.to_string(), connection_id)).map(|tracked| tracked.entry);
        if entries.is_empty() {
            guard.remove(&resource);
        }
        removed
    }

    /// Removes everything a closed connection owned.
    pub async fn remove_connection(&self, connection_id: Uuid) -> Vec<PresenceEntry> {
        let mut guard = self.state.write().await;
        let mut removed = Vec::new();
        guard.retain(|_, entries| {
            entries.retain(|(_, owner), tracked| {
                if *owner == connection_id {
                    removed.push(tracked.entry.clone());
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });
        removed
    }

    /// The live entry one connection holds on a resource.
    pub async fn get(
        &self,
        connection_id: Uuid,
        user_id: &str,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Option<PresenceEntry> {
        let now = Instant::now();
        let guard = self.state.read().await;
        guard
            .get(&(resource_type.clone(), resource_id.to_string()))?
            .get(&(user_id.to_string(), connection_id))
            .filter(|tracked| !tracked.is_expired(now))
            .map(|tracked| tracked.entry.clone())
    }

    /// Live entries on a resource, ordered by user id.
    pub async fn list(&self, resource_type: &ResourceType, resource_id: &str) -> Vec<PresenceEntry> {
        let now = Instant::now();
        let guard = self.state.read().await;
        let mut live: Vec<PresenceEntry> = guard
            .get(&(resource_type.clone(), resource_id.to_string()))
            .map(|entries| {
                entries
                    .values()
                    .filter(|tracked| !tracked.is_expired(now))
                    .map(|tracked| tracked.entry.clone())
                    .collect()
            })
            .unwrap_or_default();
        live.sort_by(|left, right| {
            left.user_id.cmp(&right.user_id).then(left.connection_id.cmp(&right.connection_id))
        });
        live
    }

    /// Evicts expired entries and returns them.
    pub async fn sweep(&self) -> Vec<PresenceEntry> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        let mut expired = Vec::new();
        guard.retain(|_, entries| {
            entries.retain(|_, tracked| {
                if tracked.is_expired(now) {
                    expired.push(tracked.entry.clone());
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });
        expired
    }

    pub async fn stats(&self) -> PresenceStats {
        let guard = self.state.read().await;
        PresenceStats {
            entries: guard.values().map(HashMap::len).sum(),
            resources: guard.len(),
        }
    }
}
