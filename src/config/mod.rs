pub mod validation;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use self::validation::validate_config;

/// Environment variable consulted when `upstream.api_key` is left empty.
pub const API_KEY_ENV: &str = "CHATBRIDGE_API_KEY";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default)]
    pub http_use_env_proxy: bool,
}

fn default_port() -> u16 {
    3001
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            http_use_env_proxy: false,
        }
    }
}

/// The chat-completion backend the bridge talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_tools_path")]
    pub tools_path: String,
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    #[serde(default = "default_files_path")]
    pub files_path: String,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_chat_path() -> String {
    "/api/chat/completions".to_string()
}
fn default_tools_path() -> String {
    "/api/v1/tools".to_string()
}
fn default_upload_path() -> String {
    "/api/v1/files/".to_string()
}
fn default_files_path() -> String {
    "/api/v1/files".to_string()
}

impl UpstreamConfig {
    /// Config pointing at `base_url` with every other field defaulted.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: String::new(),
            model: default_model(),
            chat_path: default_chat_path(),
            tools_path: default_tools_path(),
            upload_path: default_upload_path(),
            files_path: default_files_path(),
        }
    }

    fn join(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let mut out = String::with_capacity(base.len() + path.len());
        out.push_str(base);
        out.push_str(path);
        out
    }

    #[must_use]
    pub fn chat_url(&self) -> String {
        self.join(&self.chat_path)
    }

    #[must_use]
    pub fn tools_url(&self) -> String {
        self.join(&self.tools_path)
    }

    #[must_use]
    pub fn upload_url(&self) -> String {
        self.join(&self.upload_path)
    }

    /// Backend URL of one stored file, with `file_id` encoded as a single
    /// path segment. `None` when the id is not a plain id or the base URL
    /// does not parse.
    #[must_use]
    pub fn file_url(&self, file_id: &str) -> Option<String> {
        if !is_plain_file_id(file_id) {
            return None;
        }
        let mut url = url::Url::parse(&self.join(self.files_path.trim_end_matches('/'))).ok()?;
        url.path_segments_mut().ok()?.pop_if_empty().push(file_id);
        Some(url.into())
    }
}

const FILE_ID_MAX_LEN: usize = 256;

/// Backend file ids are opaque tokens (uuids in practice). Dot segments and
/// anything needing escapes are refused so an id can never address another
/// backend path.
#[must_use]
pub fn is_plain_file_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= FILE_ID_MAX_LEN
        && id != "."
        && id != ".."
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Feature flags and tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub auto_discover_tools: bool,
    #[serde(default = "default_tool_discovery_max_attempts")]
    pub tool_discovery_max_attempts: u32,
    #[serde(default = "default_tool_discovery_backoff_ms")]
    pub tool_discovery_backoff_ms: u64,
    #[serde(default = "default_tool_discovery_wait_secs")]
    pub tool_discovery_wait_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_tool_discovery_max_attempts() -> u32 {
    3
}
fn default_tool_discovery_backoff_ms() -> u64 {
    1_000
}
fn default_tool_discovery_wait_secs() -> u64 {
    5
}
fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}
fn default_max_sessions() -> usize {
    4096
}

impl FeaturesConfig {
    #[must_use]
    pub fn tool_discovery_backoff(&self) -> Duration {
        Duration::from_millis(self.tool_discovery_backoff_ms)
    }

    #[must_use]
    pub fn tool_discovery_wait(&self) -> Duration {
        Duration::from_secs(self.tool_discovery_wait_secs)
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            auto_discover_tools: true,
            tool_discovery_max_attempts: default_tool_discovery_max_attempts(),
            tool_discovery_backoff_ms: default_tool_discovery_backoff_ms(),
            tool_discovery_wait_secs: default_tool_discovery_wait_secs(),
            max_upload_bytes: default_max_upload_bytes(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Parse configuration from YAML text, fill the API key from the environment
/// when absent, and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let mut config: AppConfig = serde_yaml::from_str(contents)?;
    if config.upstream.api_key.trim().is_empty() {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            config.upstream.api_key = key;
        }
    }
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}
