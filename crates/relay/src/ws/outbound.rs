use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tablesync_common::protocol::ws::{MessageType, ServerMessage};
use tokio::sync::Notify;

/// Why a queue stopped accepting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("slow consumer")]
    SlowConsumer,
    #[error("connection closing")]
    Closing,
}

/// Result of [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest droppable message, of this type.
    QueuedAfterDrop(MessageType),
    /// The incoming message was droppable and there was no room for it.
    Dropped(MessageType),
}

/// What the writer side should do next.
#[derive(Debug, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close(QueueError),
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<ServerMessage>,
    closed: Option<QueueError>,
}

/// Bounded per-connection queue between fan-out and the socket writer.
///
/// When full, droppable pushes give way first. A critical message that
/// cannot fit closes the queue with [`QueueError::SlowConsumer`].
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState { messages: VecDeque::new(), closed: None }),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, message: ServerMessage) -> Result<PushOutcome, QueueError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = state.closed {
            return Err(reason);
        }

        let mut outcome = PushOutcome::Queued;
        if state.messages.len() >= self.capacity {
            match state.messages.iter().position(ServerMessage::is_droppable) {
                Some(oldest) => {
                    if let Some(evicted) = state.messages.remove(oldest) {
                        outcome = PushOutcome::QueuedAfterDrop(evicted.message_type());
                    }
                }
                None if message.is_droppable() => return Ok(PushOutcome::Dropped(message.message_type())),
                None => {
                    state.closed = Some(QueueError::SlowConsumer);
                    drop(state);
                    self.notify.notify_one();
                    return Err(QueueError::SlowConsumer);
                }
            }
        }

        state.messages.push_back(message);
        drop(state);
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Stops the queue. Messages already queued are discarded.
    pub fn close(&self, reason: QueueError) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Waits for the next message, or for the queue to close.
    pub async fn next(&self) -> Outbound {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(reason) = state.closed {
                    return Outbound::Close(reason);
                }
                if let Some(message) = state.messages.pop_front() {
                    return Outbound::Message(message);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).messages.len()
    }
}
