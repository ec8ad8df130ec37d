//! reel-server: HTTP handoff surface and backend status notifier.
//!
//! This crate wires the reel-* crates into a running service:
//!
//! - Axum routes for upload handoff, status lookup and pipeline events
//! - Optional shared-secret authentication
//! - A notifier that mirrors status transitions to the owning backend
//! - Graceful shutdown that fails in-flight jobs instead of orphaning them

pub mod context;
pub mod error;
pub mod middleware;
pub mod notifier;
pub mod router;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reel_av::{FfmpegEncoder, FfprobeProber, ToolRegistry};
use reel_core::config::Config;
use reel_core::events::EventBus;
use reel_db::queries::assets::{self, Lease};
use reel_pipeline::{Backends, MediaController, SqliteStore};
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::notifier::BackendNotifier;

/// Diagnostic recorded on jobs left in PROCESSING with no live owner.
pub const ORPHANED_DIAGNOSTIC: &str = "interrupted: transcoder restarted while processing";

/// How long shutdown waits for cancelled jobs to record their failure.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the server and run until SIGINT/SIGTERM.
pub async fn start(config: Config) -> reel_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    for dir in [
        &config.media.upload_dir,
        &config.media.videos_root,
        &config.media.users_root,
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let db = reel_db::init_pool(&config.server.db_path)?;
    tracing::info!("Database ready at {}", config.server.db_path.display());
    let lease = instance_lease(&config);
    tracing::info!(owner = %lease.owner, "Claiming work as this instance");
    {
        let conn = reel_db::get_conn(&db)?;
        let orphaned = assets::reset_orphaned(&conn, &lease.owner, ORPHANED_DIAGNOSTIC)?;
        if orphaned > 0 {
            tracing::warn!("Marked {orphaned} interrupted asset(s) FAILED");
        }
    }
    let store = SqliteStore::with_lease(db, lease);

    let tools = Arc::new(ToolRegistry::discover(&config.tools));
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}", info.name);
        }
    }

    let backends = Backends {
        store: Arc::new(store.clone()),
        prober: Arc::new(FfprobeProber::from_registry(
            &tools,
            Duration::from_secs(config.transcode.probe_timeout_secs),
        )?),
        encoder: Arc::new(FfmpegEncoder::from_registry(&tools)?),
    };

    let event_bus = Arc::new(EventBus::default());
    let controller = MediaController::new(&config, backends, Arc::clone(&event_bus));
    let ctx = AppContext::new(Arc::new(config.clone()), controller.clone(), tools);

    let cancel = CancellationToken::new();
    let renewal = store.spawn_lease_renewal(cancel.clone());
    let notifier = BackendNotifier::from_config(&config.backend)
        .map(|n| n.spawn(&event_bus, cancel.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| reel_core::Error::Internal(format!("Invalid server address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| reel_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;

    tracing::info!("Starting server on {addr}");

    axum::serve(listener, router::build_router(ctx))
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .map_err(|e| reel_core::Error::Internal(format!("Server error: {e}")))?;

    controller.shutdown();
    drain(&controller).await;

    cancel.cancel();
    let _ = renewal.await;
    if let Some(handle) = notifier {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// This instance's claim on the rows it moves into PROCESSING.
fn instance_lease(config: &Config) -> Lease {
    let owner = config
        .server
        .instance_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Lease::new(owner, Duration::from_secs(config.server.lease_secs.max(1)))
}

/// Wait for cancelled jobs to release their keys.
async fn drain(controller: &MediaController) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while controller.in_flight_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                "{} job(s) still running at shutdown",
                controller.in_flight_count()
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_instance_id_owns_the_lease() {
        let mut config = Config::default();
        config.server.instance_id = Some("node-1".into());
        config.server.lease_secs = 30;
        let lease = instance_lease(&config);
        assert_eq!(lease.owner, "node-1");
        assert_eq!(lease.ttl, Duration::from_secs(30));
    }

    #[test]
    fn unset_instance_id_is_random() {
        let mut config = Config::default();
        config.server.instance_id = Some("  ".into());
        config.server.lease_secs = 0;
        let a = instance_lease(&config);
        let b = instance_lease(&config);
        assert_ne!(a.owner, b.owner);
        assert_eq!(a.ttl, Duration::from_secs(1));
    }
}
