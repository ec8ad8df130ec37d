//! Axum router construction.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::middleware::auth::secret_middleware;
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let protected_routes = Router::new()
        // Videos
        .route(
            "/videos/{id}/upload",
            post(routes::uploads::upload_video).delete(routes::uploads::cancel_video),
        )
        .route("/videos/{id}/thumbnail", post(routes::uploads::upload_thumbnail))
        .route("/videos/{id}", get(routes::assets::get_video))
        // Users
        .route(
            "/users/{id}/avatar",
            post(routes::uploads::upload_avatar).get(routes::assets::get_avatar),
        )
        // SSE Events
        .route("/events", get(routes::events::events_handler))
        .layer(middleware::from_fn_with_state(ctx.clone(), secret_middleware));

    let api = Router::new()
        .route("/health", get(routes::health::health_check))
        .merge(protected_routes);

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
