// Pub/sub fan-out.
//
// Session code only ever subscribes to the local bus. With a broker
// configured, publishes go through the broker and come back into every
// instance's local bus via the bridge reader.

mod bridge;
mod broker;
mod local;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tablesync_common::ot::Operation;
use tablesync_common::protocol::ws::PresenceEntry;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use bridge::DistributedBridge;
pub use broker::{Broker, BrokerError, BrokerMessage, BrokerStream};
pub use local::{LocalBus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Joined,
    Updated,
    Cursor,
    Left,
}

/// Everything that travels over a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Committed {
        collection: String,
        document_id: String,
        committed_version: u64,
        operation: Operation,
    },
    Presence {
        action: PresenceAction,
        entry: PresenceEntry,
        /// Connection that caused the change; it does not get its own echo.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin_connection: Option<Uuid>,
    },
    Notification {
        payload: serde_json::Value,
    },
    /// Push addressed to one user's connections, or to every connection
    /// when `user_id` is absent. Travels on [`DIRECT_TOPIC`].
    Direct {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        payload: serde_json::Value,
    },
}

/// Topic for [`Event::Direct`]; not a channel, so no client can join it.
pub const DIRECT_TOPIC: &str = "direct";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event for topic {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The fan-out strategy, chosen once at construction.
#[derive(Clone)]
pub enum FanOut {
    Local(LocalBus),
    Distributed(Arc<DistributedBridge>),
}

impl FanOut {
    pub fn local(bus: LocalBus) -> Self {
        Self::Local(bus)
    }

    pub fn distributed(broker: Broker, prefix: impl Into<String>, bus: LocalBus) -> Self {
        Self::Distributed(Arc::new(DistributedBridge::new(broker, prefix, bus)))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Distributed(bridge) => bridge.broker_name(),
        }
    }

    pub fn bus(&self) -> &LocalBus {
        match self {
            Self::Local(bus) => bus,
            Self::Distributed(bridge) => bridge.bus(),
        }
    }

    pub async fn publish(&self, topic: &str, event: Event) -> Result<(), PublishError> {
        match self {
            Self::Local(bus) => {
                bus.publish(topic, Arc::new(event));
                Ok(())
            }
            Self::Distributed(bridge) => bridge.publish(topic, event).await,
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.bus().subscribe(topic)
    }

    /// Starts the broker reader when distributed.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        match self {
            Self::Local(_) => None,
            Self::Distributed(bridge) => Some(Arc::clone(bridge).start().await),
        }
    }
}
