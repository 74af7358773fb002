//! Upload side-channel and pending-file bookkeeping.
//!
//! The `file` part of an upload is re-sent to the backend as a new form; only
//! the id the backend returns is ever attached to a chat turn.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower::{Layer, ServiceExt};

use crate::error::BridgeError;
use crate::state::AppState;

const MULTIPART_FORM_DATA: &str = "multipart/form-data";
const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    meta: Option<UploadMeta>,
}

#[derive(Debug, Deserialize)]
struct UploadMeta {
    #[serde(default)]
    name: Option<String>,
}

/// The `file` part of an upload form.
#[derive(Debug)]
struct FilePart {
    filename: String,
    content_type: Option<String>,
    data: Bytes,
}

pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match upload(&state, &headers, body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "file upload rejected");
            err.into_response()
        }
    }
}

async fn upload(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, BridgeError> {
    multipart_content_type(headers)?;
    let limit = state.config.features.max_upload_bytes;
    if declared_length(headers).is_some_and(|len| len > limit) {
        return Err(too_large(limit));
    }
    let file = read_file_part(headers, body, limit).await?;

    let upstream = &state.config.upstream;
    let (status, response_body) = state
        .transport
        .forward_upload(
            &upstream.upload_url(),
            &upstream.api_key,
            &file.filename,
            file.content_type.as_deref(),
            file.data,
        )
        .await?;
    if !status.is_success() {
        return Err(BridgeError::Upstream {
            status: status.as_u16(),
            message: String::from_utf8_lossy(&response_body).into_owned(),
        });
    }

    let uploaded: UploadResponse = serde_json::from_slice(&response_body)
        .map_err(|e| BridgeError::Upload(format!("Invalid upload response: {e}")))?;
    let id = uploaded
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BridgeError::Upload("Upload response did not include a file id".to_string()))?;
    let filename = uploaded
        .filename
        .or_else(|| uploaded.meta.and_then(|meta| meta.name))
        .unwrap_or(file.filename);

    let session = state.session_for(headers);
    session.add_file_ids([id.as_str()]);
    tracing::info!(session = session.id(), file_id = %id, filename = %filename, "file uploaded");

    Ok(Json(json!({ "id": id, "filename": filename })).into_response())
}

/// Parse the form and return its first part named `file`. Other parts are
/// skipped. `limit` caps the whole body.
async fn read_file_part(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<FilePart, BridgeError> {
    let mut request = Request::new(body);
    *request.headers_mut() = headers.clone();
    let extract = tower::service_fn(|req: Request<Body>| Multipart::from_request(req, &()));
    let mut multipart = DefaultBodyLimit::max(limit)
        .layer(extract)
        .oneshot(request)
        .await
        .map_err(|rejection| BridgeError::InvalidRequest(rejection.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(&err, limit))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or(FILE_FIELD).to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|err| multipart_error(&err, limit))?;
        return Ok(FilePart {
            filename,
            content_type,
            data,
        });
    }
    Err(BridgeError::InvalidRequest(
        "Missing 'file' field in multipart body".to_string(),
    ))
}

fn multipart_error(err: &MultipartError, limit: usize) -> BridgeError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        too_large(limit)
    } else {
        BridgeError::InvalidRequest(err.body_text())
    }
}

fn multipart_content_type(headers: &HeaderMap) -> Result<&str, BridgeError> {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| {
            value
                .get(..MULTIPART_FORM_DATA.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(MULTIPART_FORM_DATA))
        })
        .ok_or_else(|| {
            BridgeError::InvalidRequest("Expected a multipart/form-data upload".to_string())
        })
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn too_large(limit: usize) -> BridgeError {
    BridgeError::PayloadTooLarge(format!("Upload exceeds the {limit} byte limit"))
}

/// Drop a pending id from the session, then ask the backend to delete the
/// file. The backend call is best effort. Ids that are not plain tokens are
/// refused before either happens.
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    headers: &HeaderMap,
    file_id: &str,
) -> Response {
    let upstream = &state.config.upstream;
    let Some(url) = upstream.file_url(file_id) else {
        return BridgeError::InvalidRequest(format!("Invalid file id '{file_id}'")).into_response();
    };
    let session = state.session_for(headers);
    let removed = session.remove_file_id(file_id);

    let backend_deleted = match state.transport.delete(&url, &upstream.api_key).await
    {
        Ok(status) if status.is_success() => true,
        Ok(status) => {
            tracing::warn!(file_id, status = status.as_u16(), "backend refused file delete");
            false
        }
        Err(err) => {
            tracing::warn!(file_id, error = %err, "backend file delete failed");
            false
        }
    };

    Json(json!({
        "id": file_id,
        "removed": removed,
        "backend_deleted": backend_deleted,
    }))
    .into_response()
}

/// Pending file ids for the caller's session.
pub fn session_files_handler(State(state): State<Arc<AppState>>, headers: &HeaderMap) -> Response {
    let session = state.session_for(headers);
    Json(json!({
        "session": session.id(),
        "fileIds": session.file_ids(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, FeaturesConfig, ServerConfig, UpstreamConfig};
    use crate::transport::HttpTransport;
    use http::HeaderValue;

    fn offline_state(max_upload_bytes: usize) -> Arc<AppState> {
        let config = AppConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::with_base_url("http://127.0.0.1:1"),
            features: FeaturesConfig {
                auto_discover_tools: false,
                max_upload_bytes,
                ..FeaturesConfig::default()
            },
        };
        let transport = HttpTransport::new(&config.server);
        Arc::new(AppState::new(config, transport))
    }

    fn multipart_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=xyz"),
        );
        headers
    }

    #[test]
    fn test_multipart_content_type() {
        assert!(multipart_content_type(&multipart_headers()).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("Multipart/Form-Data; boundary=a"));
        assert!(multipart_content_type(&headers).is_ok());

        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(matches!(
            multipart_content_type(&headers),
            Err(BridgeError::InvalidRequest(_))
        ));
        assert!(multipart_content_type(&HeaderMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected_before_backend() {
        let state = offline_state(8);
        let body = Body::from(
            "--xyz\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\r\nlarge\r\n--xyz--\r\n",
        );
        let response = upload_handler(State(state.clone()), multipart_headers(), body).await;
        assert_eq!(response.status(), http::StatusCode::PAYLOAD_TOO_LARGE);

        let session = state.sessions.get_or_create(crate::session::DEFAULT_SESSION_ID);
        assert!(session.file_ids().is_empty());
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_rejected() {
        let state = offline_state(8);
        let mut headers = multipart_headers();
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("4096"));
        let response = upload_handler(State(state), headers, Body::empty()).await;
        assert_eq!(response.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_upload_without_file_field_is_bad_request() {
        let state = offline_state(1024);
        let body = Body::from("--xyz\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--xyz--\r\n");
        let response = upload_handler(State(state), multipart_headers(), body).await;
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_file_field_name_inside_another_value_is_not_a_file() {
        let state = offline_state(1024);
        let body = Body::from(
            "--xyz\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nname=\"file\"\r\n--xyz--\r\n",
        );
        let response = upload_handler(State(state.clone()), multipart_headers(), body).await;
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);

        let session = state.sessions.get_or_create(crate::session::DEFAULT_SESSION_ID);
        assert!(session.file_ids().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_multipart_is_bad_request() {
        let state = offline_state(1024);
        let response =
            upload_handler(State(state), multipart_headers(), Body::from("not a form")).await;
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_refuses_dot_segment_ids() {
        let state = offline_state(1024);
        let headers = HeaderMap::new();
        let session = state.session_for(&headers);
        session.add_file_ids(["f1"]);

        for id in ["..", "%2e%2e", "a/b"] {
            let response = delete_handler(State(state.clone()), &headers, id).await;
            assert_eq!(response.status(), http::StatusCode::BAD_REQUEST, "{id}");
        }
        assert_eq!(session.file_ids(), vec!["f1"]);
    }

    #[tokio::test]
    async fn test_delete_removes_pending_id_even_when_backend_is_down() {
        let state = offline_state(1024);
        let headers = HeaderMap::new();
        let session = state.session_for(&headers);
        session.add_file_ids(["f1", "f2"]);

        let response = delete_handler(State(state.clone()), &headers, "f1").await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(session.file_ids(), vec!["f2"]);
    }
}
