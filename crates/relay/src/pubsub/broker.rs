use futures_util::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::warn;

const MEMORY_BROKER_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One raw broker publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// A cross-instance pub/sub transport.
#[derive(Clone)]
pub enum Broker {
    /// Shared in-process broker, so several relays in one process (tests)
    /// can stand in for several instances.
    Memory(broadcast::Sender<BrokerMessage>),
    Redis {
        client: redis::Client,
        publisher: redis::aio::MultiplexedConnection,
    },
}

impl Broker {
    pub fn memory() -> Self {
        let (sender, _) = broadcast::channel(MEMORY_BROKER_CAPACITY);
        Self::Memory(sender)
    }

    pub async fn redis(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        Ok(Self::Redis { client, publisher })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory-broker",
            Self::Redis { .. } => "redis",
        }
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        match self {
            Self::Memory(sender) => {
                // No receivers just means no instance is listening yet.
                let _ = sender.send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
                Ok(())
            }
            Self::Redis { publisher, .. } => {
                let mut connection = publisher.clone();
                connection.publish::<_, _, ()>(channel, payload).await?;
                Ok(())
            }
        }
    }

    /// Subscribes to every channel starting with `<prefix>:`.
    pub async fn subscribe_prefix(&self, prefix: &str) -> Result<BrokerStream, BrokerError> {
        match self {
            Self::Memory(sender) => Ok(BrokerStream::Memory {
                receiver: sender.subscribe(),
                prefix: format!("{prefix}:"),
            }),
            Self::Redis { client, .. } => {
                let mut pubsub = client.get_async_pubsub().await?;
                pubsub.psubscribe(format!("{prefix}:*")).await?;
                Ok(BrokerStream::Redis(pubsub.into_on_message().boxed()))
            }
        }
    }
}

pub enum BrokerStream {
    Memory { receiver: broadcast::Receiver<BrokerMessage>, prefix: String },
    Redis(BoxStream<'static, redis::Msg>),
}

impl BrokerStream {
    /// Next matching message, or `None` when the connection is gone.
    pub async fn next(&mut self) -> Option<BrokerMessage> {
        match self {
            Self::Memory { receiver, prefix } => loop {
                match receiver.recv().await {
                    Ok(message) if message.channel.starts_with(prefix.as_str()) => {
                        return Some(message)
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory broker reader lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Self::Redis(stream) => loop {
                let message = stream.next().await?;
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        return Some(BrokerMessage {
                            channel: message.get_channel_name().to_string(),
                            payload,
                        })
                    }
                    Err(error) => {
                        warn!(error = %error, channel = message.get_channel_name(), "non-text broker payload");
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_broker_filters_by_prefix() {
        let broker = Broker::memory();
        let mut stream = broker.subscribe_prefix("tablesync:ws").await.expect("subscribe");

        broker.publish("other:table:t1", "ignored").await.expect("publish");
        broker.publish("tablesync:ws:table:t1", "kept").await.expect("publish");

        let message = stream.next().await.expect("message");
        assert_eq!(message.channel, "tablesync:ws:table:t1");
        assert_eq!(message.payload, "kept");
    }

    #[tokio::test]
    async fn memory_publish_without_listeners_succeeds() {
        let broker = Broker::memory();
        broker.publish("tablesync:ws:table:t1", "{}").await.expect("publish");
    }
}
