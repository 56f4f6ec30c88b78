use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use super::Event;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Arc<Event>>,
}

type SubscriberList = Arc<RwLock<Vec<Subscriber>>>;

struct Topic {
    queue: mpsc::UnboundedSender<Arc<Event>>,
    subscribers: SubscriberList,
}

struct BusInner {
    topics: RwLock<HashMap<String, Topic>>,
    subscriber_capacity: usize,
    next_id: AtomicU64,
}

/// In-process topic bus.
///
/// Each topic owns one dispatcher task that drains the topic queue and
/// hands every event to each subscriber in turn, so a topic's subscribers
/// all observe publish order. Topics exist only while they have
/// subscribers; publishing to an empty topic is a no-op.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl LocalBus {
    pub fn with_capacity(subscriber_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                subscriber_capacity: subscriber_capacity.max(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns whether the topic had any subscriber.
    pub fn publish(&self, topic: &str, event: Arc<Event>) -> bool {
        let topics = self.inner.topics.read().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(entry) => entry.queue.send(event).is_ok(),
            None => false,
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.subscriber_capacity);

        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (queue, pending) = mpsc::unbounded_channel();
            let subscribers: SubscriberList = Arc::new(RwLock::new(Vec::new()));
            tokio::spawn(dispatch(topic.to_string(), pending, Arc::clone(&subscribers)));
            Topic { queue, subscribers }
        });
        entry
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, sender });
        drop(topics);

        Subscription {
            id,
            topic: topic.to_string(),
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|entry| entry.subscribers.read().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }
}

fn unsubscribe(inner: &BusInner, topic: &str, id: u64) {
    let mut topics = inner.topics.write().unwrap_or_else(PoisonError::into_inner);
    let Some(entry) = topics.get(topic) else {
        return;
    };
    let now_empty = {
        let mut subscribers = entry.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.is_empty()
    };
    if now_empty {
        // Dropping the queue sender lets the dispatcher drain and exit.
        topics.remove(topic);
    }
}

async fn dispatch(
    topic: String,
    mut pending: mpsc::UnboundedReceiver<Arc<Event>>,
    subscribers: SubscriberList,
) {
    while let Some(event) = pending.recv().await {
        let targets: Vec<(u64, mpsc::Sender<Arc<Event>>)> = subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|subscriber| (subscriber.id, subscriber.sender.clone()))
            .collect();

        for (id, sender) in targets {
            // Waits for room rather than dropping; a full subscriber
            // delays the rest of this topic only.
            if sender.send(Arc::clone(&event)).await.is_err() {
                debug!(topic = %topic, subscriber = id, "subscriber went away during dispatch");
                subscribers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|subscriber| subscriber.id != id);
            }
        }
    }
    debug!(topic = %topic, "topic dispatcher stopped");
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    receiver: mpsc::Receiver<Arc<Event>>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            unsubscribe(&inner, &self.topic, self.id);
        }
    }
}
