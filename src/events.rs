// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process domain event bus.
//!
//! A thin wrapper over a broadcast channel: publishers never block and a
//! publish with no subscribers is not an error. Subscribers that fall behind
//! lose the oldest events (the bus is a signal path, not a durable queue).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::models::TaskStatus;

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSeverity {
    Information,
    Warning,
    Error,
}

/// Events published on the core's internal bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskStatusChanged {
        task_id: String,
        from_status: Option<TaskStatus>,
        to_status: Option<TaskStatus>,
    },
    WorkspaceProvisioned {
        workspace_id: String,
        task_id: String,
    },
    AutomationTaskStarted {
        task_id: String,
    },
    AutomationAgentAttached {
        task_id: String,
    },
    AutomationReviewAgentAttached {
        task_id: String,
    },
    AutomationTaskEnded {
        task_id: String,
    },
    UserNotification {
        message: String,
        title: String,
        severity: NotificationSeverity,
    },
    CoreHostStarting,
    CoreHostRunning {
        transport: String,
        address: String,
        port: Option<u16>,
    },
    CoreHostDraining {
        reason: String,
    },
    CoreHostStopped,
}

const EVENT_BUS_CAPACITY: usize = 1024;

/// Broadcast event bus shared by all core services.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event; silently dropped when nobody is subscribed.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(DomainEvent::CoreHostStarting);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::TaskStatusChanged {
            task_id: "t1".to_string(),
            from_status: Some(TaskStatus::Backlog),
            to_status: Some(TaskStatus::InProgress),
        });
        bus.publish(DomainEvent::AutomationTaskStarted {
            task_id: "t1".to_string(),
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, DomainEvent::TaskStatusChanged { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, DomainEvent::AutomationTaskStarted { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(DomainEvent::CoreHostStopped);
        assert!(matches!(a.recv().await.unwrap(), DomainEvent::CoreHostStopped));
        assert!(matches!(b.recv().await.unwrap(), DomainEvent::CoreHostStopped));
    }
}
