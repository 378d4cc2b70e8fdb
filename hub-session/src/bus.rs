//! A small generic broadcast bus.
//!
//! Publishers don't know who, if anyone, is listening; subscribers have an
//! explicit lifetime (the returned `Receiver` is dropped when the listener
//! goes away), rather than every component holding a reference to every
//! other component and calling `.emit(...)` on it directly.
//!
//! The message hub uses one `BroadcastBus<OutboundEnvelope>` per hub to fan
//! out server-originated events (session-update, task-update, chat, ...) to
//! every connected session's writer task. The filesystem notifier uses a
//! second, independently-typed bus for its own batched delivery. Both are
//! instances of the same primitive.

use tokio::sync::broadcast;

/// A cloneable fan-out channel. Cloning gives a new handle to the same
/// underlying bus; each `subscribe()` call gets its own queue.
pub struct BroadcastBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> BroadcastBus<T> {
    /// Create a bus with the given per-subscriber backlog capacity. A slow
    /// subscriber that falls more than `capacity` messages behind will see
    /// `RecvError::Lagged` and can resynchronize rather than block publishers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a message to all current subscribers. Returns the number of
    /// receivers the message was delivered to; zero is not an error — a
    /// broadcast with no listeners yet is a normal, silent no-op.
    pub fn publish(&self, message: T) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    /// Subscribe to future messages. Past messages are never replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Clone for BroadcastBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
