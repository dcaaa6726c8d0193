//! Router assembly.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the public router: health check, provider webhook, media socket.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::api::health_check))
        .route("/twiml", post(handlers::webhook::twiml_webhook))
        .route("/media-stream", get(handlers::media::media_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
