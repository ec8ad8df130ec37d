//! Shared application context.
//!
//! [`AppContext`] is handed to every route handler via Axum state. It is a
//! bundle of `Arc`s and a [`MediaController`] handle, so cloning it per
//! request is cheap.

use std::sync::Arc;

use reel_av::ToolRegistry;
use reel_core::config::Config;
use reel_core::events::EventBus;
use reel_pipeline::MediaController;

#[derive(Clone)]
pub struct AppContext {
    /// Configuration the server was started with.
    pub config: Arc<Config>,
    /// Upload handoff and status controller.
    pub controller: MediaController,
    /// Pipeline events.
    pub event_bus: Arc<EventBus>,
    /// Tools discovered at startup.
    pub tools: Arc<ToolRegistry>,
}

impl AppContext {
    pub fn new(
        config: Arc<Config>,
        controller: MediaController,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let event_bus = Arc::clone(controller.events());
        Self {
            config,
            controller,
            event_bus,
            tools,
        }
    }
}
