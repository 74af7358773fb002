use serde_json::json;

/// Error type shared by every module of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Upload error: {0}")]
    Upload(String),
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("A turn is already in flight for session '{0}'")]
    TurnInFlight(String),
    #[error("Turn cancelled by client")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Conflict,
    PayloadTooLarge,
    Upstream,
    ClientClosed,
    ServerError,
}

impl BridgeError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            BridgeError::TurnInFlight(_) => ErrorCategory::Conflict,
            BridgeError::PayloadTooLarge(_) => ErrorCategory::PayloadTooLarge,
            BridgeError::Upstream { .. } | BridgeError::Transport(_) | BridgeError::Upload(_) => {
                ErrorCategory::Upstream
            }
            BridgeError::Cancelled => ErrorCategory::ClientClosed,
            BridgeError::Config(_) | BridgeError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// HTTP status surfaced to the caller. Upstream failures mirror the
    /// backend's status code.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            BridgeError::Upstream { status, .. } => {
                http::StatusCode::from_u16(*status).unwrap_or(http::StatusCode::BAD_GATEWAY)
            }
            other => http_status_for_category(other.category()),
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "Configuration error",
            BridgeError::InvalidRequest(_) => "Invalid request",
            BridgeError::Upstream { .. } => "Upstream request failed",
            BridgeError::Transport(_) => "Upstream unreachable",
            BridgeError::Upload(_) => "File upload failed",
            BridgeError::PayloadTooLarge(_) => "Payload too large",
            BridgeError::TurnInFlight(_) => "Turn already in flight",
            BridgeError::Cancelled => "Turn cancelled",
            BridgeError::Internal(_) => "Internal error",
        }
    }

    fn details(&self) -> String {
        match self {
            BridgeError::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Conflict => http::StatusCode::CONFLICT,
        ErrorCategory::PayloadTooLarge => http::StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCategory::Upstream => http::StatusCode::BAD_GATEWAY,
        // nginx's "client closed request"; never actually read by the departed client
        ErrorCategory::ClientClosed => {
            http::StatusCode::from_u16(499).unwrap_or(http::StatusCode::BAD_REQUEST)
        }
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Format an error as `(status, {"error": .., "details": ..})`.
#[must_use]
pub fn format_error(err: &BridgeError) -> (http::StatusCode, serde_json::Value) {
    let body = json!({
        "error": err.summary(),
        "details": err.details(),
    });
    (err.status_code(), body)
}

impl axum::response::IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_mirrored() {
        let err = BridgeError::Upstream {
            status: 500,
            message: "boom".to_string(),
        };
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Upstream request failed");
        assert_eq!(body["details"], "boom");
    }

    #[test]
    fn invalid_upstream_status_falls_back_to_bad_gateway() {
        let err = BridgeError::Upstream {
            status: 42,
            message: String::new(),
        };
        assert_eq!(err.status_code(), http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn boundary_errors_map_to_client_statuses() {
        assert_eq!(
            BridgeError::PayloadTooLarge("x".into()).status_code(),
            http::StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            BridgeError::TurnInFlight("default".into()).status_code(),
            http::StatusCode::CONFLICT
        );
        assert_eq!(
            BridgeError::InvalidRequest("x".into()).status_code(),
            http::StatusCode::BAD_REQUEST
        );
        assert_eq!(BridgeError::Cancelled.status_code().as_u16(), 499);
    }
}
