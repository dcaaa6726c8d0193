//! Plain HTTP handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// Health check endpoint.
///
/// Returns server status and the number of active calls.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeCalls": state.manager.registry().active_count(),
    }))
}
