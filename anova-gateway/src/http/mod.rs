//! HTTP + SSE surface: thin JSON translation of the Manager/Device/BLE
//! operations already specified elsewhere, plus authentication.

pub mod auth;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::manager::Manager;
use crate::sse::SseHub;

/// Shared application state threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub sse: Arc<SseHub>,
    pub settings: Arc<Settings>,
}

pub fn build_router(state: AppState) -> Router {
    let api = routes::router(state.clone());

    let mut router = Router::new();
    if let Some(dist_dir) = state.settings.frontend_dist_dir.clone() {
        router = router.nest_service("/", ServeDir::new(dist_dir));
    }

    router
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
