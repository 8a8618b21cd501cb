use axum::routing::{any, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use super::handlers::{self, AppState};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/shorten", post(handlers::shorten_url))
        .route("/api/stats/{short_code}", get(handlers::get_stats))
        .route("/health", get(handlers::health_check))
        .route("/{short_code}", any(handlers::redirect_url))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
