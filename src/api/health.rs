use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "chatbridge is running",
        "config": {
            "upstream": config.upstream.base_url,
            "model": config.upstream.model,
            "sessions_count": state.sessions.len(),
            "features": {
                "log_level": config.features.log_level,
                "auto_discover_tools": config.features.auto_discover_tools,
                "tool_discovery_max_attempts": config.features.tool_discovery_max_attempts,
                "max_upload_bytes": config.features.max_upload_bytes,
            }
        }
    }))
}
