use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use crate::error::BridgeError;
use crate::protocol::request::ChatTurnRequest;
use crate::state::AppState;

/// Run one chat turn and stream its canonical frames as SSE.
///
/// Failures before the first frame (bad body, turn in flight, upstream
/// rejection) are returned as JSON errors with their mapped status.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    match handle(&state, &headers, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, BridgeError> {
    let request: ChatTurnRequest = serde_json::from_slice(body)
        .map_err(|e| BridgeError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
    let session = state.session_for(headers);
    let turn = state
        .orchestrator
        .start_turn(session, request, state.turn_cancellation())
        .await?;

    let frames = turn.into_frames().map(Ok::<_, Infallible>);
    Ok(sse_ok_response(Body::from_stream(frames)))
}

#[inline]
fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}
