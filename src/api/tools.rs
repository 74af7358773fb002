use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::protocol::ToolServerDescriptor;
use crate::state::AppState;

/// Tool-server descriptors for the caller's session. With discovery enabled
/// an empty cache triggers a fetch bounded by the configured wait.
pub async fn list_handler(State(state): State<Arc<AppState>>, headers: &HeaderMap) -> Response {
    let session = state.session_for(headers);
    let servers = if state.config.features.auto_discover_tools {
        let fetcher = state.tool_fetcher();
        session
            .tool_servers_for_turn(Some(&fetcher), state.config.features.tool_discovery_wait())
            .await
    } else {
        session.cached_tool_servers().unwrap_or_else(|| Arc::from([]))
    };
    tools_response(session.id(), &servers)
}

/// Drop the cached descriptors and fetch them again.
pub async fn refresh_handler(State(state): State<Arc<AppState>>, headers: &HeaderMap) -> Response {
    let session = state.session_for(headers);
    let servers = session
        .refresh_tool_servers(state.tool_fetcher(), state.config.features.tool_discovery_wait())
        .await;
    tracing::info!(session = session.id(), servers = servers.len(), "tool servers refreshed");
    tools_response(session.id(), &servers)
}

fn tools_response(session: &str, servers: &[ToolServerDescriptor]) -> Response {
    Json(json!({
        "session": session,
        "tool_servers": servers,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, FeaturesConfig, ServerConfig, UpstreamConfig};
    use crate::protocol::canonical::CapabilitySpec;
    use crate::transport::HttpTransport;

    fn state(auto_discover_tools: bool) -> Arc<AppState> {
        let config = AppConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::with_base_url("http://127.0.0.1:1"),
            features: FeaturesConfig {
                auto_discover_tools,
                tool_discovery_max_attempts: 1,
                tool_discovery_backoff_ms: 0,
                tool_discovery_wait_secs: 2,
                ..FeaturesConfig::default()
            },
        };
        let transport = HttpTransport::new(&config.server);
        Arc::new(AppState::new(config, transport))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_list_returns_cached_descriptors() {
        let state = state(false);
        let headers = HeaderMap::new();
        state.session_for(&headers).set_tool_servers(vec![ToolServerDescriptor {
            url: "http://search.local".to_string(),
            specs: vec![CapabilitySpec {
                name: "search".to_string(),
                description: String::new(),
                parameters: json!({}),
            }],
        }]);

        let body = body_json(list_handler(State(state), &headers).await).await;
        assert_eq!(body["tool_servers"][0]["url"], "http://search.local");
        assert_eq!(body["tool_servers"][0]["specs"][0]["name"], "search");
    }

    #[tokio::test]
    async fn test_list_without_discovery_is_empty() {
        let body = body_json(list_handler(State(state(false)), &HeaderMap::new()).await).await;
        assert_eq!(body["tool_servers"], json!([]));
        assert_eq!(body["session"], "default");
    }

    #[tokio::test]
    async fn test_refresh_against_unreachable_backend_is_empty() {
        let body = body_json(refresh_handler(State(state(true)), &HeaderMap::new()).await).await;
        assert_eq!(body["tool_servers"], json!([]));
    }
}
