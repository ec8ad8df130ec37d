//! Status callback to the owning backend.
//!
//! [`BackendNotifier`] follows the event bus and POSTs every status
//! transition to `backend.status_url`. Delivery is fire-and-forget: errors
//! are logged and never reach the pipeline.

use std::sync::Arc;
use std::time::Duration;

use reel_core::config::BackendConfig;
use reel_core::events::{Event, EventBus, EventPayload};
use reel_core::{EntityId, MediaKind, MediaStatus};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::middleware::auth::X_TRANSCODER_SECRET;

/// Body of one status callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub id: EntityId,
    pub kind: MediaKind,
    pub status: MediaStatus,
    pub duration: Option<f64>,
}

impl StatusUpdate {
    /// The callback for `event`, if it is a status transition.
    pub fn from_event(event: &Event) -> Option<Self> {
        match &event.payload {
            EventPayload::StatusChanged {
                entity,
                kind,
                status,
                duration_secs,
                ..
            } => Some(Self {
                id: entity.clone(),
                kind: *kind,
                status: *status,
                duration: *duration_secs,
            }),
            _ => None,
        }
    }
}

pub struct BackendNotifier {
    client: Client,
    url: String,
    secret: Option<String>,
}

impl BackendNotifier {
    /// `None` when no status URL is configured.
    pub fn from_config(config: &BackendConfig) -> Option<Self> {
        let url = config.status_url.clone()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build backend HTTP client: {e}");
                Client::new()
            });
        Some(Self {
            client,
            url,
            secret: config.secret.clone(),
        })
    }

    /// Deliver one update.
    pub async fn notify(&self, update: &StatusUpdate) {
        let mut request = self.client.post(&self.url).json(update);
        if let Some(secret) = &self.secret {
            request = request.header(X_TRANSCODER_SECRET.clone(), secret);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(id = %update.id, status = %update.status, "Backend notified");
            }
            Ok(resp) => {
                tracing::warn!(
                    id = %update.id,
                    status = %update.status,
                    "Backend status callback returned {}",
                    resp.status()
                );
            }
            Err(e) => {
                tracing::warn!(id = %update.id, "Backend status callback failed: {e}");
            }
        }
    }

    /// Follow `events` until `cancel` fires.
    pub fn spawn(self, events: &Arc<EventBus>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            tracing::info!(url = %self.url, "Backend notifier started");
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = cancel.cancelled() => break,
                };
                match event {
                    Ok(event) => {
                        if let Some(update) = StatusUpdate::from_event(&event) {
                            self.notify(&update).await;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Backend notifier lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::info!("Backend notifier stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::events::EventCategory;
    use reel_core::JobId;

    #[test]
    fn only_status_changes_become_updates() {
        let entity = EntityId::parse("clip").unwrap();
        let status = Event::new(
            EventCategory::Status,
            EventPayload::StatusChanged {
                entity: entity.clone(),
                kind: MediaKind::Video,
                job_id: JobId::new(),
                status: MediaStatus::Ready,
                duration_secs: Some(12.5),
                diagnostic: None,
            },
        );
        let update = StatusUpdate::from_event(&status).unwrap();
        assert_eq!(update.status, MediaStatus::Ready);
        assert_eq!(update.duration, Some(12.5));

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["id"], "clip");
        assert_eq!(json["kind"], "video");
        assert_eq!(json["status"], "READY");

        let accepted = Event::new(
            EventCategory::Pipeline,
            EventPayload::UploadAccepted {
                entity,
                kind: MediaKind::Video,
                job_id: JobId::new(),
            },
        );
        assert!(StatusUpdate::from_event(&accepted).is_none());
    }

    #[test]
    fn no_url_means_no_notifier() {
        assert!(BackendNotifier::from_config(&BackendConfig::default()).is_none());
    }
}
