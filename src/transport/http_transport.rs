use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ServerConfig;
use crate::error::BridgeError;

use super::retry_policy::PARSED_ENDPOINT_CACHE_MAX_ENTRIES;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_STREAM: &str = "text/event-stream";
const APPLICATION_JSON: &str = "application/json";
const UPLOAD_FIELD: &str = "file";

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
    use_env_proxy: bool,
) -> Result<reqwest::Client, BridgeError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout);

    if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| BridgeError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// HTTP client for every backend call: completions, tool discovery and file
/// storage. Cheap to share behind an `Arc`.
pub struct HttpTransport {
    base_client: OnceLock<reqwest::Client>,
    parsed_url_cache: RwLock<FxHashMap<String, Arc<url::Url>>>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
    use_env_proxy: bool,
}

impl HttpTransport {
    /// Create a new transport with connection pooling and timeouts from the given server config.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };

        Self {
            base_client: OnceLock::new(),
            parsed_url_cache: RwLock::new(FxHashMap::default()),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            timeout: Duration::from_secs(config.timeout),
            use_env_proxy: config.http_use_env_proxy,
        }
    }

    fn client(&self) -> &reqwest::Client {
        self.base_client.get_or_init(|| {
            match build_reqwest_client(
                self.pool_max_idle_per_host,
                self.pool_idle_timeout,
                self.timeout,
                self.use_env_proxy,
            ) {
                Ok(client) => client,
                Err(err) => {
                    tracing::error!(error = %err, "failed to build configured reqwest client, falling back to default client");
                    reqwest::Client::new()
                }
            }
        })
    }

    fn parsed_url(&self, url: &str) -> Result<Arc<url::Url>, BridgeError> {
        if let Some(cached) = self.parsed_url_cache.read().get(url) {
            return Ok(cached.clone());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| BridgeError::Transport(format!("Invalid upstream URL: {e}")))?;

        let mut cache = self.parsed_url_cache.write();
        if let Some(existing) = cache.get(url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PARSED_ENDPOINT_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        let parsed = Arc::new(parsed);
        cache.insert(url.to_string(), parsed.clone());
        Ok(parsed)
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, BridgeError> {
        let parsed_url = self.parsed_url(url)?;
        let mut request = reqwest::Request::new(method, parsed_url.as_ref().clone());
        *request.headers_mut() = headers;
        if let Some(body) = body {
            *request.body_mut() = Some(reqwest::Body::from(body));
        }
        self.client()
            .execute(request)
            .await
            .map_err(|err| BridgeError::Transport(err.to_string()))
    }

    /// Open a streaming completion request. The response is returned as soon
    /// as headers arrive, whatever the status; the caller owns the body.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the URL is invalid or the
    /// backend cannot be reached.
    pub async fn post_stream(
        &self,
        url: &str,
        api_key: &str,
        body: Bytes,
    ) -> Result<reqwest::Response, BridgeError> {
        let mut headers = auth_headers(api_key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
        self.execute(Method::POST, url, headers, Some(body)).await
    }

    /// GET with the bearer key. The caller inspects status and headers.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the backend cannot be reached.
    pub async fn get(&self, url: &str, api_key: &str) -> Result<reqwest::Response, BridgeError> {
        let mut headers = auth_headers(api_key);
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        self.execute(Method::GET, url, headers, None).await
    }

    /// Send one file to the backend as a fresh `multipart/form-data` body
    /// with a single `file` part.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidRequest`] for an unusable part content
    /// type and [`BridgeError::Transport`] when the backend cannot be reached.
    pub async fn forward_upload(
        &self,
        url: &str,
        api_key: &str,
        filename: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<(StatusCode, Bytes), BridgeError> {
        let parsed_url = self.parsed_url(url)?;
        let length = data.len() as u64;
        let mut part = reqwest::multipart::Part::stream_with_length(data, length)
            .file_name(filename.to_string());
        if let Some(content_type) = content_type {
            part = part.mime_str(content_type).map_err(|_| {
                BridgeError::InvalidRequest(format!("Invalid file content type '{content_type}'"))
            })?;
        }
        let form = reqwest::multipart::Form::new().part(UPLOAD_FIELD, part);

        let mut headers = auth_headers(api_key);
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        let response = self
            .client()
            .post(parsed_url.as_ref().clone())
            .headers(headers)
            .multipart(form)
            .send()
            .await
            .map_err(|err| BridgeError::Transport(err.to_string()))?;
        read_buffered(response).await
    }

    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the backend cannot be reached.
    pub async fn delete(&self, url: &str, api_key: &str) -> Result<StatusCode, BridgeError> {
        let response = self
            .execute(Method::DELETE, url, auth_headers(api_key), None)
            .await?;
        Ok(response.status())
    }
}

fn auth_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if api_key.is_empty() {
        return headers;
    }
    match HeaderValue::from_str(&format!("Bearer {api_key}")) {
        Ok(mut value) => {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Err(_) => tracing::warn!("api key is not a valid header value, sending without authorization"),
    }
    headers
}

async fn read_buffered(response: reqwest::Response) -> Result<(StatusCode, Bytes), BridgeError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| BridgeError::Transport(format!("Failed to read response body: {e}")))?;
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_reqwest_client_is_lazy() {
        let transport = HttpTransport::new(&ServerConfig::default());
        assert!(transport.base_client.get().is_none());
        let _ = transport.client();
        assert!(transport.base_client.get().is_some());
    }

    #[test]
    fn test_parsed_url_cache_hit() {
        let transport = HttpTransport::new(&ServerConfig::default());
        let url = "http://backend.local/api/chat/completions";

        let first = transport.parsed_url(url).unwrap();
        let second = transport.parsed_url(url).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.parsed_url_cache.read().len(), 1);
    }

    #[test]
    fn test_parsed_url_cache_is_bounded() {
        let transport = HttpTransport::new(&ServerConfig::default());
        for idx in 0..(PARSED_ENDPOINT_CACHE_MAX_ENTRIES + 32) {
            let url = format!("http://backend.local/api/v1/files/file-{idx}");
            let _ = transport.parsed_url(&url).unwrap();
        }
        assert!(transport.parsed_url_cache.read().len() <= PARSED_ENDPOINT_CACHE_MAX_ENTRIES);
    }

    #[test]
    fn test_parsed_url_invalid() {
        let transport = HttpTransport::new(&ServerConfig::default());
        let err = transport.parsed_url("://bad-url").unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[test]
    fn test_auth_headers() {
        assert!(auth_headers("").get(AUTHORIZATION).is_none());
        let headers = auth_headers("sk-test");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert!(headers.get(AUTHORIZATION).unwrap().is_sensitive());
    }
}
