//! Typed lifecycle notifications for monitoring and test harnesses.
//!
//! Subscribers receive every event emitted after they subscribe; dropping the
//! receiver unsubscribes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::CoordinatorConfig;
use crate::coordinator::CoordinatorStats;
use crate::coordinator::health::HealthSnapshot;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthWarningKind {
    HighFailureRatio,
    StuckProcessing,
    PoolSaturated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrawlEvent {
    Started {
        config: CoordinatorConfig,
    },
    DiscoveryCompleted {
        sources: Vec<String>,
        duration: Duration,
    },
    UpdateCompleted {
        processed: usize,
        new: usize,
        updated: usize,
        duration: Duration,
    },
    HealthWarning {
        kind: HealthWarningKind,
        stats: HealthSnapshot,
    },
    Stopped {
        stats: CoordinatorStats,
    },
    SessionCreated {
        source: String,
        id: String,
    },
    SessionClosed {
        source: String,
        id: String,
    },
}

impl CrawlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::DiscoveryCompleted { .. } => "discovery_completed",
            Self::UpdateCompleted { .. } => "update_completed",
            Self::HealthWarning { .. } => "health_warning",
            Self::Stopped { .. } => "stopped",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionClosed { .. } => "session_closed",
        }
    }
}

/// Cloneable handle for emitting and subscribing to [`CrawlEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CrawlEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: CrawlEvent) {
        tracing::trace!(event = event.name(), "Emitting event");
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(CrawlEvent::SessionCreated {
            source: "immowelt".to_string(),
            id: "s1".to_string(),
        });
        bus.emit(CrawlEvent::SessionClosed {
            source: "immowelt".to_string(),
            id: "s1".to_string(),
        });

        assert_eq!(rx.recv().await.unwrap().name(), "session_created");
        assert_eq!(rx.recv().await.unwrap().name(), "session_closed");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(CrawlEvent::DiscoveryCompleted {
            sources: vec![],
            duration: Duration::from_millis(5),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropping_receiver_unsubscribes() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CrawlEvent::UpdateCompleted {
            processed: 4,
            new: 1,
            updated: 2,
            duration: Duration::from_secs(3),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update_completed");
        assert_eq!(json["processed"], 4);
    }
}
