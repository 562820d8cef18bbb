use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::{handlers, middleware::metrics_middleware, migrations, watch};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Health, config and metrics
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/metrics", get(handlers::get_metrics))
        // Migrations
        .route("/vms/{uuid}", post(migrations::vm_action))
        .route("/vms/{uuid}/migrate", get(migrations::get_migration))
        .route("/vms/{uuid}/migrate/watch", get(watch::watch_migration))
        .route("/migrations", get(migrations::list_migrations))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware)),
    )
}
