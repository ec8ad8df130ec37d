//! Pipeline event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late-joining readers (the HTTP
//! events route, the backend notifier) can catch up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{EntityId, JobId};
use crate::media::{MediaKind, MediaStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

/// Audience category for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Operator diagnostics (rejections, per-derivative failures).
    Pipeline,
    /// Status transitions the owning backend mirrors.
    Status,
}

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    UploadAccepted {
        entity: EntityId,
        kind: MediaKind,
        job_id: JobId,
    },
    UploadRejected {
        entity: EntityId,
        kind: MediaKind,
        reason: String,
    },
    StatusChanged {
        entity: EntityId,
        kind: MediaKind,
        job_id: JobId,
        status: MediaStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
    DerivativeFailed {
        entity: EntityId,
        kind: MediaKind,
        job_id: JobId,
        spec: String,
        error: String,
    },
}

/// A timestamped, categorised event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Audience category.
    pub category: EventCategory,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(category: EventCategory, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category,
            payload,
        }
    }
}

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// `capacity` controls the broadcast channel buffer size, not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`].
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, category: EventCategory, payload: EventPayload) {
        let event = Event::new(category, payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> EntityId {
        EntityId::parse("clip").unwrap()
    }

    fn status(status: MediaStatus) -> EventPayload {
        EventPayload::StatusChanged {
            entity: entity(),
            kind: MediaKind::Video,
            job_id: JobId::new(),
            status,
            duration_secs: None,
            diagnostic: None,
        }
    }

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.broadcast(EventCategory::Status, status(MediaStatus::Processing));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.category, EventCategory::Status);
        match &event.payload {
            EventPayload::StatusChanged { status, .. } => {
                assert_eq!(*status, MediaStatus::Processing)
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::new(256);
        for _ in 0..150 {
            bus.broadcast(EventCategory::Status, status(MediaStatus::Ready));
        }
        assert_eq!(bus.recent_events(200).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn recent_events_newest_first() {
        let bus = EventBus::new(16);
        bus.broadcast(EventCategory::Status, status(MediaStatus::Processing));
        bus.broadcast(
            EventCategory::Pipeline,
            EventPayload::UploadRejected {
                entity: entity(),
                kind: MediaKind::Video,
                reason: "busy".into(),
            },
        );

        let recent = bus.recent_events(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].category, EventCategory::Pipeline);
    }

    #[test]
    fn status_payload_shape() {
        let json = serde_json::to_value(status(MediaStatus::Failed)).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["entity"], "clip");
        assert!(json.get("diagnostic").is_none());
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.broadcast(EventCategory::Status, status(MediaStatus::Failed));
        assert_eq!(bus.recent_events(10).len(), 1);
    }
}
