//! Server-Sent Events (SSE) handler.
//!
//! Subscribes to the [`reel_core::events::EventBus`], optionally filters by
//! category, replays recent events for late joiners, and sends keepalive
//! heartbeats.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use reel_core::events::EventCategory;
use serde::Deserialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;
use uuid::Uuid;

use crate::context::AppContext;

/// Number of recent events replayed on connect.
const REPLAY: usize = 50;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// "pipeline" or "status".
    pub category: Option<EventCategory>,
}

/// GET /api/events
pub async fn events_handler(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsQuery>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let filter = params.category;
    // Subscribe before the snapshot so nothing falls between the two.
    let mut rx = ctx.event_bus.subscribe();
    let recent = ctx.event_bus.recent_events(REPLAY);
    let replayed: HashSet<Uuid> = recent.iter().map(|e| e.id).collect();
    let wanted = move |c: EventCategory| filter.map_or(true, |f| f == c);

    let stream = async_stream::stream! {
        for event in recent.into_iter().rev() {
            if wanted(event.category) {
                if let Ok(data) = serde_json::to_string(&event) {
                    yield Ok(Event::default().data(data));
                }
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if wanted(event.category) && !replayed.contains(&event.id) {
                        if let Ok(data) = serde_json::to_string(&event) {
                            yield Ok(Event::default().data(data));
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("SSE client lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
