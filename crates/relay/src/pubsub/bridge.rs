use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerMessage, BrokerStream};
use super::local::LocalBus;
use super::{Event, PublishError};

const PUBLISH_RETRIES: u32 = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(20);
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Relays events between the broker and this instance's local bus.
///
/// Publishes go to the broker only and arrive locally through the reader,
/// so every instance sees the broker's order for a topic.
pub struct DistributedBridge {
    broker: Broker,
    prefix: String,
    bus: LocalBus,
}

impl DistributedBridge {
    pub fn new(broker: Broker, prefix: impl Into<String>, bus: LocalBus) -> Self {
        Self { broker, prefix: prefix.into(), bus }
    }

    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    fn broker_channel(&self, topic: &str) -> String {
        format!("{}:{topic}", self.prefix)
    }

    fn topic_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel.strip_prefix(self.prefix.as_str())?.strip_prefix(':')
    }

    pub async fn publish(&self, topic: &str, event: Event) -> Result<(), PublishError> {
        let payload = serde_json::to_string(&event)
            .map_err(|source| PublishError::Encode { topic: topic.to_string(), source })?;
        let channel = self.broker_channel(topic);

        let mut attempt = 0;
        loop {
            match self.broker.publish(&channel, &payload).await {
                Ok(()) => return Ok(()),
                Err(publish_error) if attempt < PUBLISH_RETRIES => {
                    attempt += 1;
                    warn!(error = %publish_error, topic, attempt, "broker publish failed, retrying");
                    tokio::time::sleep(PUBLISH_RETRY_DELAY * attempt).await;
                }
                Err(publish_error) => {
                    error!(
                        error = %publish_error,
                        topic,
                        "broker publish failed, delivering to local subscribers only"
                    );
                    self.bus.publish(topic, Arc::new(event));
                    return Ok(());
                }
            }
        }
    }

    /// Subscribes once up front, then spawns the reader loop. Messages
    /// published after this returns are guaranteed to be observed.
    pub async fn start(self: Arc<Self>) -> JoinHandle<()> {
        let initial = match self.broker.subscribe_prefix(&self.prefix).await {
            Ok(stream) => Some(stream),
            Err(subscribe_error) => {
                warn!(error = %subscribe_error, "initial broker subscribe failed, will retry");
                None
            }
        };
        tokio::spawn(async move { self.run_reader(initial).await })
    }

    async fn run_reader(&self, mut stream: Option<BrokerStream>) {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            if let Some(mut active) = stream.take() {
                info!(prefix = %self.prefix, broker = self.broker.name(), "broker reader connected");
                backoff = RECONNECT_BACKOFF_MIN;
                while let Some(message) = active.next().await {
                    self.forward(message);
                }
                warn!(prefix = %self.prefix, "broker stream ended, reconnecting");
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);

            match self.broker.subscribe_prefix(&self.prefix).await {
                Ok(next) => stream = Some(next),
                Err(subscribe_error) => {
                    warn!(error = %subscribe_error, retry_in_ms = backoff.as_millis() as u64, "broker resubscribe failed");
                }
            }
        }
    }

    fn forward(&self, message: BrokerMessage) {
        let Some(topic) = self.topic_of(&message.channel) else {
            return;
        };
        match serde_json::from_str::<Event>(&message.payload) {
            Ok(event) => {
                self.bus.publish(topic, Arc::new(event));
            }
            Err(decode_error) => {
                debug!(error = %decode_error, channel = %message.channel, "dropping undecodable broker payload");
            }
        }
    }
}
