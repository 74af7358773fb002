use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_features(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if !upstream.base_url.starts_with("http://") && !upstream.base_url.starts_with("https://") {
        return Err(validation_err(
            "upstream.base_url must start with http:// or https://",
        ));
    }
    if url::Url::parse(&upstream.base_url).is_err() {
        return Err(validation_err(format!(
            "upstream.base_url '{}' is not a valid URL",
            upstream.base_url
        )));
    }
    if upstream.model.trim().is_empty() {
        return Err(validation_err("upstream.model cannot be empty"));
    }
    for (field, path) in [
        ("chat_path", &upstream.chat_path),
        ("tools_path", &upstream.tools_path),
        ("upload_path", &upstream.upload_path),
        ("files_path", &upstream.files_path),
    ] {
        if !path.starts_with('/') {
            return Err(validation_err(format!(
                "upstream.{field} must start with '/'"
            )));
        }
    }
    Ok(())
}

fn validate_features(config: &AppConfig) -> Result<(), ConfigError> {
    let features = &config.features;
    if features.tool_discovery_max_attempts == 0 {
        return Err(validation_err(
            "features.tool_discovery_max_attempts must be at least 1",
        ));
    }
    if features.max_upload_bytes == 0 {
        return Err(validation_err(
            "features.max_upload_bytes must be greater than 0",
        ));
    }
    if features.max_sessions == 0 {
        return Err(validation_err("features.max_sessions must be at least 1"));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is invalid. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeaturesConfig, ServerConfig, UpstreamConfig};

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::with_base_url("http://localhost:3000"),
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let mut config = valid_config();
        config.upstream.base_url = "ftp://example.com".to_string();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("base_url"));
    }

    #[test]
    fn test_rejects_relative_paths() {
        let mut config = valid_config();
        config.upstream.tools_path = "api/v1/tools".to_string();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("tools_path"));
    }

    #[test]
    fn test_rejects_zero_discovery_attempts() {
        let mut config = valid_config();
        config.features.tool_discovery_max_attempts = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_max_sessions() {
        let mut config = valid_config();
        config.features.max_sessions = 0;
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("max_sessions"));
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let mut config = valid_config();
        config.features.log_level = "warning".to_string();
        assert!(validate_config(&config).is_ok());
        config.features.log_level = "VERBOSE".to_string();
        assert!(validate_config(&config).is_err());
    }
}
