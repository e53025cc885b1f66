// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Queued messages: per-(key, lane) FIFOs of user text awaiting delivery
//! to a running agent.
//!
//! Keys are task ids or session ids; lanes separate implementation-agent
//! messages from planner messages. Payloads are capped when appended to
//! prompts (see [`crate::limits::truncate_queue_payload`]), not on enqueue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::models::full_id;

/// Delivery lane for a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Implementation,
    Planner,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implementation => "implementation",
            Self::Planner => "planner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "implementation" => Some(Self::Implementation),
            "planner" => Some(Self::Planner),
            _ => None,
        }
    }
}

/// One queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub key: String,
    pub lane: Lane,
    pub content: String,
    pub queued_at: DateTime<Utc>,
}

/// Queue status for one (key, lane) pair.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub key: String,
    pub lane: Lane,
    pub queued: usize,
}

/// In-memory queued message service.
#[derive(Clone, Default)]
pub struct QueuedMessageService {
    queues: Arc<Mutex<HashMap<(String, Lane), VecDeque<QueuedMessage>>>>,
}

impl QueuedMessageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_message(&self, key: &str, lane: Lane, content: &str) -> QueuedMessage {
        let message = QueuedMessage {
            id: full_id(),
            key: key.to_string(),
            lane,
            content: content.to_string(),
            queued_at: Utc::now(),
        };
        let mut queues = self.queues.lock().await;
        queues
            .entry((key.to_string(), lane))
            .or_default()
            .push_back(message.clone());
        message
    }

    /// Pop the oldest message for (key, lane).
    pub async fn take_queued(&self, key: &str, lane: Lane) -> Option<QueuedMessage> {
        let mut queues = self.queues.lock().await;
        let queue_key = (key.to_string(), lane);
        let queue = queues.get_mut(&queue_key)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&queue_key);
        }
        message
    }

    /// Drain every message for (key, lane), oldest first.
    pub async fn take_all_queued(&self, key: &str, lane: Lane) -> Vec<QueuedMessage> {
        let mut queues = self.queues.lock().await;
        queues
            .remove(&(key.to_string(), lane))
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Peek pending messages without removing them.
    pub async fn get_queued(&self, key: &str, lane: Lane) -> Vec<QueuedMessage> {
        let queues = self.queues.lock().await;
        queues
            .get(&(key.to_string(), lane))
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one message by id. Returns whether it was found.
    pub async fn remove_message(&self, key: &str, lane: Lane, message_id: &str) -> bool {
        let mut queues = self.queues.lock().await;
        let queue_key = (key.to_string(), lane);
        let Some(queue) = queues.get_mut(&queue_key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|m| m.id != message_id);
        let removed = queue.len() < before;
        if queue.is_empty() {
            queues.remove(&queue_key);
        }
        removed
    }

    /// Drop all pending messages for (key, lane); returns how many.
    pub async fn cancel_queued(&self, key: &str, lane: Lane) -> usize {
        let mut queues = self.queues.lock().await;
        queues
            .remove(&(key.to_string(), lane))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn get_status(&self, key: &str, lane: Lane) -> QueueStatus {
        let queues = self.queues.lock().await;
        QueueStatus {
            key: key.to_string(),
            lane,
            queued: queues
                .get(&(key.to_string(), lane))
                .map(VecDeque::len)
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order_per_lane() {
        let service = QueuedMessageService::new();
        service
            .queue_message("t1", Lane::Implementation, "first")
            .await;
        service
            .queue_message("t1", Lane::Implementation, "second")
            .await;
        service.queue_message("t1", Lane::Planner, "planner note").await;

        let first = service.take_queued("t1", Lane::Implementation).await.unwrap();
        assert_eq!(first.content, "first");
        let second = service.take_queued("t1", Lane::Implementation).await.unwrap();
        assert_eq!(second.content, "second");
        assert!(service.take_queued("t1", Lane::Implementation).await.is_none());

        // Planner lane untouched.
        assert_eq!(service.get_status("t1", Lane::Planner).await.queued, 1);
    }

    #[tokio::test]
    async fn test_take_all_and_cancel() {
        let service = QueuedMessageService::new();
        for i in 0..3 {
            service
                .queue_message("s1", Lane::Implementation, &format!("m{i}"))
                .await;
        }

        let drained = service.take_all_queued("s1", Lane::Implementation).await;
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].content, "m0");

        service.queue_message("s1", Lane::Implementation, "again").await;
        assert_eq!(service.cancel_queued("s1", Lane::Implementation).await, 1);
        assert_eq!(
            service.get_status("s1", Lane::Implementation).await.queued,
            0
        );
    }

    #[tokio::test]
    async fn test_remove_message_by_id() {
        let service = QueuedMessageService::new();
        let kept = service.queue_message("t1", Lane::Implementation, "keep").await;
        let removed = service
            .queue_message("t1", Lane::Implementation, "remove")
            .await;

        assert!(
            service
                .remove_message("t1", Lane::Implementation, &removed.id)
                .await
        );
        assert!(
            !service
                .remove_message("t1", Lane::Implementation, &removed.id)
                .await
        );

        let remaining = service.get_queued("t1", Lane::Implementation).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);
    }

    #[test]
    fn test_lane_round_trip() {
        assert_eq!(Lane::parse("implementation"), Some(Lane::Implementation));
        assert_eq!(Lane::parse("planner"), Some(Lane::Planner));
        assert_eq!(Lane::parse("other"), None);
        assert_eq!(Lane::Implementation.as_str(), "implementation");
    }
}
