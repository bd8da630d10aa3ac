//! Runtime event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle events published by the engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Container created; init is blocked at the start barrier.
    ContainerCreated { id: String, pid: u32, timestamp: i64 },
    /// Init process released from the barrier.
    ContainerStarted { id: String, pid: u32, timestamp: i64 },
    /// Non-init process started inside the container.
    ProcessStarted { id: String, pid: u32, timestamp: i64 },
    /// Container frozen.
    ContainerPaused { id: String, timestamp: i64 },
    /// Container thawed.
    ContainerResumed { id: String, timestamp: i64 },
    /// Init process observed gone.
    ContainerStopped { id: String, timestamp: i64 },
    /// Resource limits updated.
    ContainerUpdated { id: String, timestamp: i64 },
    /// Checkpoint images written.
    ContainerCheckpointed {
        id: String,
        pre_dump: bool,
        timestamp: i64,
    },
    /// Container restored from images.
    ContainerRestored { id: String, pid: u32, timestamp: i64 },
    /// Container directory and cgroup removed.
    ContainerDestroyed { id: String, timestamp: i64 },
}

impl RuntimeEvent {
    /// The container this event is about.
    #[must_use]
    pub fn container_id(&self) -> &str {
        match self {
            Self::ContainerCreated { id, .. }
            | Self::ContainerStarted { id, .. }
            | Self::ProcessStarted { id, .. }
            | Self::ContainerPaused { id, .. }
            | Self::ContainerResumed { id, .. }
            | Self::ContainerStopped { id, .. }
            | Self::ContainerUpdated { id, .. }
            | Self::ContainerCheckpointed { id, .. }
            | Self::ContainerRestored { id, .. }
            | Self::ContainerDestroyed { id, .. } => id,
        }
    }
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        tracing::trace!(?event, "Publishing runtime event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Current UTC time as a Unix timestamp, for event payloads.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(RuntimeEvent::ContainerPaused {
            id: "c1".to_string(),
            timestamp: 1,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.container_id(), "c1");
        assert!(matches!(event, RuntimeEvent::ContainerPaused { .. }));
    }

    #[test]
    fn publish_without_subscribers() {
        EventBus::new().publish(RuntimeEvent::ContainerDestroyed {
            id: "c1".to_string(),
            timestamp: 1,
        });
    }
}
