use tokio::sync::broadcast;
use tracing::trace;

use super::QueueEvent;

/// Broadcast publisher for queue lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: QueueEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Events published while nobody is subscribed are dropped; the claim
    /// protocol never depends on delivery.
    pub fn publish(&self, event: QueueEvent) {
        let name = event.name();
        let published = PublishedEvent {
            event,
            published_at: chrono::Utc::now(),
        };

        if self.sender.send(published).is_err() {
            trace!(event = name, "No subscribers for queue event");
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
