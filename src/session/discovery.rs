//! Tool-server discovery against the backend's tools endpoint.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::protocol::canonical::{retain_usable, CapabilitySpec, ToolServerDescriptor};
use crate::transport::{retry_delay, HttpTransport};

/// Fetches tool-server descriptors with bounded linear-backoff retry.
pub struct ToolServerFetcher {
    transport: Arc<HttpTransport>,
    url: String,
    api_key: String,
    max_attempts: u32,
    backoff: Duration,
}

struct AttemptFailure {
    error: BridgeError,
    headers: Option<http::HeaderMap>,
}

impl ToolServerFetcher {
    #[must_use]
    pub fn new(
        transport: Arc<HttpTransport>,
        url: impl Into<String>,
        api_key: impl Into<String>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            transport,
            url: url.into(),
            api_key: api_key.into(),
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    #[must_use]
    pub fn from_config(transport: Arc<HttpTransport>, config: &AppConfig) -> Self {
        Self::new(
            transport,
            config.upstream.tools_url(),
            config.upstream.api_key.clone(),
            config.features.tool_discovery_max_attempts,
            config.features.tool_discovery_backoff(),
        )
    }

    /// First successful attempt wins. Exhausted retries degrade to an empty
    /// list; discovery failures never fail a turn.
    pub async fn fetch_tool_servers(&self) -> Vec<ToolServerDescriptor> {
        for attempt in 0..self.max_attempts {
            match self.fetch_once().await {
                Ok(servers) => {
                    tracing::info!(
                        url = %self.url,
                        attempt = attempt + 1,
                        servers = servers.len(),
                        "tool servers discovered"
                    );
                    return servers;
                }
                Err(failure) => {
                    tracing::warn!(
                        url = %self.url,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %failure.error,
                        "tool discovery attempt failed"
                    );
                    if attempt + 1 < self.max_attempts {
                        let delay = retry_delay(failure.headers.as_ref(), self.backoff, attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        tracing::warn!(url = %self.url, "tool discovery exhausted, continuing without tools");
        Vec::new()
    }

    async fn fetch_once(&self) -> Result<Vec<ToolServerDescriptor>, AttemptFailure> {
        let response = self
            .transport
            .get(&self.url, &self.api_key)
            .await
            .map_err(|error| AttemptFailure {
                error,
                headers: None,
            })?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let message = response.text().await.unwrap_or_default();
            return Err(AttemptFailure {
                error: BridgeError::Upstream {
                    status: status.as_u16(),
                    message,
                },
                headers: Some(headers),
            });
        }
        let body = response.bytes().await.map_err(|e| AttemptFailure {
            error: BridgeError::Transport(format!("Failed to read tools response: {e}")),
            headers: None,
        })?;
        let payload: Value = serde_json::from_slice(&body).map_err(|e| AttemptFailure {
            error: BridgeError::Upstream {
                status: status.as_u16(),
                message: format!("Invalid tools payload: {e}"),
            },
            headers: None,
        })?;
        Ok(parse_tool_servers(&payload))
    }
}

/// Extract usable descriptors from a tools payload.
///
/// Accepts a bare array or an object holding one under `tool_servers`,
/// `tools` or `data`. Specs may sit under `specs`, `specs.specs`,
/// `capabilitySpecs` or `tools`, either flat or OpenAI `function`-wrapped.
#[must_use]
pub fn parse_tool_servers(payload: &Value) -> Vec<ToolServerDescriptor> {
    let items = payload.as_array().or_else(|| {
        ["tool_servers", "tools", "data"]
            .into_iter()
            .find_map(|field| payload.get(field).and_then(Value::as_array))
    });
    let Some(items) = items else {
        return Vec::new();
    };

    let servers = items.iter().filter_map(parse_descriptor).collect();
    retain_usable(servers)
}

fn parse_descriptor(item: &Value) -> Option<ToolServerDescriptor> {
    let url = item
        .get("url")
        .or_else(|| item.get("server_url"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();

    let specs_value = item
        .get("specs")
        .and_then(|specs| specs.get("specs").or(Some(specs)))
        .or_else(|| item.get("capabilitySpecs"))
        .or_else(|| item.get("tools"));
    let specs = specs_value
        .and_then(Value::as_array)
        .map(|specs| specs.iter().filter_map(parse_spec).collect())
        .unwrap_or_default();

    Some(ToolServerDescriptor { url, specs })
}

fn parse_spec(spec: &Value) -> Option<CapabilitySpec> {
    let spec = spec.get("function").unwrap_or(spec);
    let name = spec.get("name").and_then(Value::as_str)?.trim();
    if name.is_empty() {
        return None;
    }
    Some(CapabilitySpec {
        name: name.to_string(),
        description: spec
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parameters: spec
            .get("parameters")
            .filter(|parameters| parameters.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
    })
}
