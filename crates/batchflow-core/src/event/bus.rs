//! Broadcast bus for `BatchEvent`.
//!
//! Publishing never blocks a runner. Events published while nobody listens
//! are dropped, and slow subscribers observe `Lagged` instead of stalling the
//! engine.

use batchflow_types::event::BatchEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for job, step, chunk and partition events.
///
/// Cloning the bus clones the sender, so every runner of a job can publish.
pub struct EventBus {
    sender: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a subscriber that receives all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: BatchEvent) {
        tracing::trace!(event = event.name(), "publishing batch event");
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> &broadcast::Sender<BatchEvent> {
        &self.sender
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
