//! One request/response cycle against the completion backend.
//!
//! [`TurnOrchestrator::start_turn`] runs the `Idle -> Requesting` half of a
//! turn and hands back a [`TurnStream`] once upstream headers arrive with an
//! ok status. The stream then drives `Streaming -> Draining -> Done`, or ends
//! in `Failed`/`Cancelled`. Every exit edge runs the same cleanup in
//! `TurnGuard::drop`: the upstream reader is released, the session permit is
//! returned and the outcome is logged.

pub mod reader;
mod turn_id;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::observability::log_turn_complete;
use crate::protocol::canonical::{retain_usable, CanonicalEvent, Message, ToolServerDescriptor};
use crate::protocol::encoder::encode;
use crate::protocol::request::{build_upstream_request, normalize_messages, ChatTurnRequest};
use crate::protocol::upstream::{decode_line_into, UpstreamEvent, UpstreamEvents};
use crate::session::{Session, ToolServerFetcher, TurnPermit};
use crate::stream::LineReassembler;
use crate::transport::HttpTransport;
use crate::util::{log_preview, next_message_id};

pub use reader::{ChunkStream, UpstreamReader};
use turn_id::TurnIdGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Requesting,
    Streaming,
    Draining,
    Done,
    Failed,
    Cancelled,
}

impl TurnState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Requesting => "requesting",
            TurnState::Streaming => "streaming",
            TurnState::Draining => "draining",
            TurnState::Done => "done",
            TurnState::Failed => "failed",
            TurnState::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnState::Done | TurnState::Failed | TurnState::Cancelled
        )
    }
}

pub struct TurnOrchestrator {
    transport: Arc<HttpTransport>,
    fetcher: Option<Arc<ToolServerFetcher>>,
    chat_url: String,
    api_key: String,
    model: String,
    tool_wait: Duration,
    turn_ids: TurnIdGenerator,
}

impl TurnOrchestrator {
    /// `fetcher` is `None` when automatic tool discovery is disabled.
    #[must_use]
    pub fn new(
        config: &AppConfig,
        transport: Arc<HttpTransport>,
        fetcher: Option<Arc<ToolServerFetcher>>,
    ) -> Self {
        Self {
            transport,
            fetcher,
            chat_url: config.upstream.chat_url(),
            api_key: config.upstream.api_key.clone(),
            model: config.upstream.model.clone(),
            tool_wait: config.features.tool_discovery_wait(),
            turn_ids: TurnIdGenerator::new(),
        }
    }

    /// Claim the session, build the upstream request and wait for response
    /// headers.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::TurnInFlight`] when the session already runs a turn.
    /// - [`BridgeError::InvalidRequest`] when no message carries text.
    /// - [`BridgeError::Upstream`] for a non-ok backend status (mirrored).
    /// - [`BridgeError::Transport`] when the backend is unreachable.
    /// - [`BridgeError::Cancelled`] when `cancel` fires before headers arrive.
    ///
    /// Pending file ids are kept on every error so the turn can be retried.
    pub async fn start_turn(
        &self,
        session: Arc<Session>,
        request: ChatTurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnStream, BridgeError> {
        let permit = session.begin_turn()?;
        let turn_id = self.turn_ids.next_id();
        let started = Instant::now();

        match self
            .request_upstream(&session, request, &cancel, &turn_id)
            .await
        {
            Ok((reader, consumed_files)) => Ok(TurnStream {
                permit,
                reader,
                cancel,
                turn_id,
                consumed_files,
                started,
            }),
            Err(err) => {
                let state = if matches!(err, BridgeError::Cancelled) {
                    TurnState::Cancelled
                } else {
                    TurnState::Failed
                };
                match &err {
                    BridgeError::InvalidRequest(_) | BridgeError::Cancelled => {
                        tracing::info!(session = session.id(), turn = %turn_id, error = %err, "turn rejected");
                    }
                    _ => {
                        tracing::error!(session = session.id(), turn = %turn_id, error = %err, "turn failed before streaming");
                    }
                }
                log_turn_complete(session.id(), &turn_id, state, 0, started);
                Err(err)
            }
        }
    }

    async fn request_upstream(
        &self,
        session: &Arc<Session>,
        request: ChatTurnRequest,
        cancel: &CancellationToken,
        turn_id: &str,
    ) -> Result<(UpstreamReader, Vec<String>), BridgeError> {
        let messages = normalize_messages(&request.messages);
        session.add_file_ids(&request.file_ids);
        session.add_file_ids(messages.iter().flat_map(Message::file_ids));
        if messages.iter().all(|message| message.text().is_empty()) {
            return Err(BridgeError::InvalidRequest("No valid messages".to_string()));
        }

        let tool_servers = self.tool_servers(session, request.tool_servers, cancel).await?;
        let file_ids = session.file_ids();
        let body = build_upstream_request(&self.model, &messages, &file_ids, &tool_servers);
        let body = serde_json::to_vec(&body)
            .map_err(|e| BridgeError::Internal(format!("Failed to encode upstream request: {e}")))?;

        tracing::info!(
            session = session.id(),
            turn = turn_id,
            messages = messages.len(),
            files = file_ids.len(),
            tool_servers = tool_servers.len(),
            "requesting upstream completion"
        );

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BridgeError::Cancelled),
            response = self.transport.post_stream(&self.chat_url, &self.api_key, Bytes::from(body)) => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = log_preview(&message), "upstream rejected turn");
            return Err(BridgeError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        Ok((UpstreamReader::from_response(response), file_ids))
    }

    // Inbound descriptors override the session cache for this turn only.
    async fn tool_servers(
        &self,
        session: &Arc<Session>,
        inbound: Vec<ToolServerDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<Arc<[ToolServerDescriptor]>, BridgeError> {
        let inbound = retain_usable(inbound);
        if !inbound.is_empty() {
            return Ok(inbound.into());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BridgeError::Cancelled),
            servers = session.tool_servers_for_turn(self.fetcher.as_ref(), self.tool_wait) => Ok(servers),
        }
    }
}

/// A turn whose upstream answered with an ok status, ready to stream.
pub struct TurnStream {
    permit: TurnPermit,
    reader: UpstreamReader,
    cancel: CancellationToken,
    turn_id: String,
    consumed_files: Vec<String>,
    started: Instant,
}

impl TurnStream {
    /// Assemble a stream over an already-open upstream body.
    #[must_use]
    pub fn new(
        permit: TurnPermit,
        reader: UpstreamReader,
        cancel: CancellationToken,
        turn_id: impl Into<String>,
        consumed_files: Vec<String>,
    ) -> Self {
        Self {
            permit,
            reader,
            cancel,
            turn_id: turn_id.into(),
            consumed_files,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Lazy, finite, non-restartable sequence of downstream frames, one
    /// canonical event per item. Dropping it early cancels the turn.
    pub fn into_frames(self) -> impl Stream<Item = Bytes> + Send + 'static {
        let TurnStream {
            permit,
            reader,
            cancel,
            turn_id,
            consumed_files,
            started,
        } = self;

        async_stream::stream! {
            let mut guard = TurnGuard {
                permit,
                reader,
                turn_id,
                state: TurnState::Streaming,
                frames: 0,
                started,
            };
            let message_id: Arc<str> = Arc::from(next_message_id());
            let mut reassembler = LineReassembler::new();
            let mut lines = Vec::new();
            let mut events = UpstreamEvents::new();
            let mut pending: Vec<CanonicalEvent> = Vec::new();

            for event in [
                CanonicalEvent::StreamStart,
                CanonicalEvent::StepStart,
                CanonicalEvent::TextStart { id: message_id.clone() },
            ] {
                guard.frames += 1;
                yield Bytes::from(encode(&event));
            }

            let mut upstream_done = false;
            while !upstream_done {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    chunk = guard.reader.next_chunk() => Some(chunk),
                };
                let Some(chunk) = next else {
                    guard.state = TurnState::Cancelled;
                    break;
                };

                match chunk {
                    Ok(Some(bytes)) => {
                        reassembler.feed_into(&bytes, &mut lines);
                    }
                    Ok(None) => {
                        guard.state = TurnState::Draining;
                        upstream_done = true;
                    }
                    Err(err) => {
                        tracing::error!(
                            session = guard.permit.session().id(),
                            turn = %guard.turn_id,
                            error = %err,
                            "upstream stream failed mid-turn"
                        );
                        guard.state = TurnState::Failed;
                        guard.reader.release();
                        guard.frames += 1;
                        yield Bytes::from(encode(&CanonicalEvent::Error { message: err.to_string() }));
                        break;
                    }
                }

                let mut saw_done = false;
                for line in lines.drain(..) {
                    events.clear();
                    decode_line_into(&line, &mut events);
                    saw_done |= collect_events(&mut events, &message_id, &mut pending);
                }
                // Tail content after the sentinel, or an unterminated last line,
                // is emitted before the terminal events.
                if saw_done || upstream_done {
                    if let Some(tail) = reassembler.flush() {
                        events.clear();
                        decode_line_into(&tail, &mut events);
                        saw_done |= collect_events(&mut events, &message_id, &mut pending);
                    }
                }
                if saw_done {
                    upstream_done = true;
                    guard.reader.release();
                }

                for event in pending.drain(..) {
                    guard.frames += 1;
                    yield Bytes::from(encode(&event));
                }
            }

            if upstream_done {
                for event in [
                    CanonicalEvent::TextEnd { id: message_id.clone() },
                    CanonicalEvent::StepFinish,
                    CanonicalEvent::StreamFinish,
                ] {
                    guard.frames += 1;
                    yield Bytes::from(encode(&event));
                }
                // Done is final once the terminator is handed out.
                guard.complete(&consumed_files);
                yield Bytes::from(encode(&CanonicalEvent::StreamDone));
            }
        }
    }
}

// Returns whether the done sentinel was among `events`.
fn collect_events(
    events: &mut UpstreamEvents,
    message_id: &Arc<str>,
    pending: &mut Vec<CanonicalEvent>,
) -> bool {
    let mut saw_done = false;
    for event in events.drain(..) {
        match event {
            UpstreamEvent::TextDelta(delta) => pending.push(CanonicalEvent::TextDelta {
                id: message_id.clone(),
                delta,
            }),
            UpstreamEvent::ToolCallDelta(calls) => pending.push(CanonicalEvent::ToolCall {
                id: message_id.clone(),
                calls,
            }),
            UpstreamEvent::Done => saw_done = true,
        }
    }
    saw_done
}

struct TurnGuard {
    permit: TurnPermit,
    reader: UpstreamReader,
    turn_id: String,
    state: TurnState,
    frames: u64,
    started: Instant,
}

impl TurnGuard {
    fn complete(&mut self, consumed_files: &[String]) {
        self.reader.release();
        self.state = TurnState::Done;
        self.frames += 1;
        self.permit.session().remove_file_ids(consumed_files);
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.reader.release();
        if !self.state.is_terminal() {
            self.state = TurnState::Cancelled;
        }
        log_turn_complete(
            self.permit.session().id(),
            &self.turn_id,
            self.state,
            self.frames,
            self.started,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use serde_json::Value;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};

    fn chunks(parts: &[&'static str]) -> ChunkStream {
        let items: Vec<Result<Bytes, BridgeError>> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part.as_bytes())))
            .collect();
        stream::iter(items).boxed()
    }

    fn turn(session: &Arc<Session>, body: ChunkStream, files: Vec<String>) -> TurnStream {
        let permit = session.begin_turn().unwrap();
        TurnStream::new(permit, UpstreamReader::new(body), CancellationToken::new(), "t1", files)
    }

    async fn collect_frames(stream: TurnStream) -> Vec<String> {
        stream
            .into_frames()
            .map(|frame| String::from_utf8(frame.to_vec()).unwrap())
            .collect()
            .await
    }

    fn frame_types(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|frame| {
                let payload = frame.strip_prefix("data: ").unwrap().trim_end();
                if payload == "[DONE]" {
                    return "[DONE]".to_string();
                }
                let value: Value = serde_json::from_str(payload).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn deltas(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| {
                let payload = frame.strip_prefix("data: ")?.trim_end();
                let value: Value = serde_json::from_str(payload).ok()?;
                (value["type"] == "text-delta").then(|| value["delta"].as_str().unwrap().to_string())
            })
            .collect()
    }

    const HELLO_SSE: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: [DONE]\n\n";

    #[tokio::test]
    async fn test_single_chunk_hello() {
        let session = Arc::new(Session::new("s"));
        let frames = collect_frames(turn(&session, chunks(&[HELLO_SSE]), Vec::new())).await;

        assert_eq!(
            frame_types(&frames),
            vec![
                "start", "start-step", "text-start", "text-delta", "text-end",
                "finish-step", "finish", "[DONE]"
            ]
        );
        assert_eq!(deltas(&frames), vec!["Hello"]);
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        assert!(!session.is_turn_in_flight());
    }

    #[tokio::test]
    async fn test_split_mid_json_matches_single_chunk() {
        let (head, tail) = HELLO_SSE.split_at(25);
        let session = Arc::new(Session::new("s"));
        let split = collect_frames(turn(&session, chunks(&[head, tail]), Vec::new())).await;
        let whole = collect_frames(turn(&session, chunks(&[HELLO_SSE]), Vec::new())).await;

        assert_eq!(frame_types(&split), frame_types(&whole));
        assert_eq!(deltas(&split), vec!["Hello"]);
    }

    #[tokio::test]
    async fn test_text_ids_are_shared_within_turn() {
        let session = Arc::new(Session::new("s"));
        let frames = collect_frames(turn(&session, chunks(&[HELLO_SSE]), Vec::new())).await;
        let ids: Vec<Value> = frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame.strip_prefix("data: ")?.trim_end()).ok())
            .filter(|value| value["type"].as_str().is_some_and(|kind| kind.starts_with("text-")))
            .map(|value| value["id"].clone())
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id == &ids[0]));
    }

    #[tokio::test]
    async fn test_content_after_done_in_final_chunk_precedes_terminals() {
        let session = Arc::new(Session::new("s"));
        let body = "0:\"a\"\ndata: [DONE]\n0:\"b\"";
        let frames = collect_frames(turn(&session, chunks(&[body, "0:\"never read\"\n"]), Vec::new())).await;

        assert_eq!(deltas(&frames), vec!["a", "b"]);
        let types = frame_types(&frames);
        assert_eq!(&types[types.len() - 4..], &["text-end", "finish-step", "finish", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_end_of_body_without_sentinel_drains() {
        let session = Arc::new(Session::new("s"));
        let body = "{\"type\":\"text-delta\",\"delta\":\"x\",\"id\":\"up\"}\n0:\"y\"";
        let frames = collect_frames(turn(&session, chunks(&[body]), Vec::new())).await;
        assert_eq!(deltas(&frames), vec!["x", "y"]);
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_empty_body_still_terminates() {
        let session = Arc::new(Session::new("s"));
        let frames = collect_frames(turn(&session, chunks(&[]), Vec::new())).await;
        assert_eq!(
            frame_types(&frames),
            vec!["start", "start-step", "text-start", "text-end", "finish-step", "finish", "[DONE]"]
        );
    }

    #[tokio::test]
    async fn test_tool_call_delta_is_forwarded_in_order() {
        let session = Arc::new(Session::new("s"));
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Checking\",\"tool_calls\":[{\"index\":0,\"id\":\"call_1\"}]}}]}\n",
            "data: [DONE]\n"
        );
        let frames = collect_frames(turn(&session, chunks(&[body]), Vec::new())).await;
        let types = frame_types(&frames);
        let delta_at = types.iter().position(|kind| kind == "text-delta").unwrap();
        assert_eq!(types[delta_at + 1], "tool-call");
    }

    #[tokio::test]
    async fn test_done_clears_consumed_file_ids() {
        let session = Arc::new(Session::new("s"));
        session.add_file_ids(["f1"]);
        let frames = collect_frames(turn(&session, chunks(&[HELLO_SSE]), vec!["f1".to_string()])).await;
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        assert!(session.file_ids().is_empty());
    }

    #[tokio::test]
    async fn test_done_keeps_ids_added_while_streaming() {
        let session = Arc::new(Session::new("s"));
        session.add_file_ids(["f1"]);
        let stream = turn(&session, chunks(&[HELLO_SSE]), vec!["f1".to_string()]);
        session.add_file_ids(["f2"]);
        let frames = collect_frames(stream).await;
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        assert_eq!(session.file_ids(), vec!["f2"]);
    }

    #[tokio::test]
    async fn test_mid_stream_error_emits_error_frame_and_keeps_files() {
        let session = Arc::new(Session::new("s"));
        session.add_file_ids(["f1"]);
        let items: Vec<Result<Bytes, BridgeError>> = vec![
            Ok(Bytes::from_static(b"0:\"partial\"\n")),
            Err(BridgeError::Transport("connection reset".to_string())),
        ];
        let frames = collect_frames(turn(&session, stream::iter(items).boxed(), vec!["f1".to_string()])).await;

        let types = frame_types(&frames);
        assert_eq!(types.last().unwrap(), "error");
        assert!(!types.contains(&"[DONE]".to_string()));
        assert_eq!(deltas(&frames), vec!["partial"]);
        assert_eq!(session.file_ids(), vec!["f1"]);
        assert!(!session.is_turn_in_flight());
    }

    struct DropFlagStream {
        first: Option<Bytes>,
        dropped: Arc<AtomicBool>,
    }

    impl Stream for DropFlagStream {
        type Item = Result<Bytes, BridgeError>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.first.take() {
                Some(bytes) => Poll::Ready(Some(Ok(bytes))),
                None => Poll::Pending,
            }
        }
    }

    impl Drop for DropFlagStream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn stalled_turn(session: &Arc<Session>, cancel: CancellationToken) -> (TurnStream, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = DropFlagStream {
            first: Some(Bytes::from_static(b"0:\"hi\"\n")),
            dropped: dropped.clone(),
        };
        let permit = session.begin_turn().unwrap();
        let stream = TurnStream::new(
            permit,
            UpstreamReader::new(body.boxed()),
            cancel,
            "t-stalled",
            vec!["f1".to_string()],
        );
        (stream, dropped)
    }

    #[tokio::test]
    async fn test_cancellation_releases_reader_and_keeps_files() {
        let session = Arc::new(Session::new("s"));
        session.add_file_ids(["f1"]);
        let cancel = CancellationToken::new();
        let (turn, dropped) = stalled_turn(&session, cancel.clone());
        let mut frames = Box::pin(turn.into_frames());

        // start, start-step, text-start, text-delta
        for _ in 0..4 {
            assert!(frames.next().await.is_some());
        }
        assert!(session.is_turn_in_flight());

        cancel.cancel();
        assert!(frames.next().await.is_none());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!session.is_turn_in_flight());
        assert_eq!(session.file_ids(), vec!["f1"]);
    }

    #[tokio::test]
    async fn test_dropping_the_stream_is_cancellation() {
        let session = Arc::new(Session::new("s"));
        let (turn, dropped) = stalled_turn(&session, CancellationToken::new());
        let mut frames = Box::pin(turn.into_frames());
        assert!(frames.next().await.is_some());
        drop(frames);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!session.is_turn_in_flight());
        assert!(session.begin_turn().is_ok());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TurnState::Done.is_terminal());
        assert!(TurnState::Failed.is_terminal());
        assert!(TurnState::Cancelled.is_terminal());
        assert!(!TurnState::Draining.is_terminal());
        assert_eq!(TurnState::Streaming.as_str(), "streaming");
    }
}
