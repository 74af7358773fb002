//! Decoding of upstream stream lines.
//!
//! The backend emits one of three line shapes depending on its mode:
//!
//! 1. OpenAI-style SSE: `data: {"choices":[{"delta":{...}}]}` and `data: [DONE]`
//! 2. token tags: `0:"<json-escaped token>"`
//! 3. pre-canonical JSON: `{"type":"text-delta","delta":"..","id":".."}`
//!
//! Anything else is dropped. Decoding never fails the stream: a line that
//! cannot be understood yields no events.

use serde::Deserialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::stream::sse::{is_done_payload, sse_data_payload};
use crate::util::log_preview;

/// One event recovered from an upstream line.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    ToolCallDelta(Vec<serde_json::Value>),
    Done,
}

pub type UpstreamEvents = SmallVec<[UpstreamEvent; 2]>;

const TOKEN_TAG_TEXT: &str = "0:";

#[derive(Debug, Default, Deserialize)]
struct LinePayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    delta: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    tool_calls: Option<Vec<serde_json::Value>>,
}

/// Decode one logical line into upstream events.
#[must_use]
pub fn decode_line(line: &str) -> UpstreamEvents {
    let mut out = UpstreamEvents::new();
    decode_line_into(line, &mut out);
    out
}

/// Decode one logical line, appending events into a caller-provided buffer.
///
/// When a chunk carries both `content` and `tool_calls`, the text delta is
/// pushed first.
pub fn decode_line_into(line: &str, out: &mut UpstreamEvents) {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return;
    }

    if let Some(payload) = sse_data_payload(trimmed) {
        if is_done_payload(payload) {
            out.push(UpstreamEvent::Done);
            return;
        }
        match serde_json::from_str::<LinePayload>(payload) {
            Ok(parsed) => push_payload_events(parsed, out),
            Err(err) => drop_line(trimmed, &err),
        }
        return;
    }

    if let Some(token) = trimmed.strip_prefix(TOKEN_TAG_TEXT) {
        match serde_json::from_str::<String>(token.trim()) {
            Ok(text) => push_text(text, out),
            Err(err) => drop_line(trimmed, &err),
        }
        return;
    }

    if trimmed.starts_with('{') {
        match serde_json::from_str::<LinePayload>(trimmed) {
            Ok(parsed) => push_payload_events(parsed, out),
            Err(err) => drop_line(trimmed, &err),
        }
        return;
    }

    debug!(line = log_preview(trimmed), "ignoring unrecognized upstream line");
}

fn push_payload_events(payload: LinePayload, out: &mut UpstreamEvents) {
    if let Some(delta) = payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
    {
        if let Some(content) = delta.content {
            if let Some(text) = content_text(content) {
                push_text(text, out);
            }
        }
        if let Some(calls) = delta.tool_calls {
            if !calls.is_empty() {
                out.push(UpstreamEvent::ToolCallDelta(calls));
            }
        }
        return;
    }

    if payload.kind.as_deref() == Some("text-delta") {
        if let Some(serde_json::Value::String(text)) = payload.delta {
            push_text(text, out);
        }
    }
}

// `content` is normally a string; some backends send a part array instead.
fn content_text(content: serde_json::Value) -> Option<String> {
    match content {
        serde_json::Value::String(text) => Some(text),
        serde_json::Value::Array(parts) => {
            let mut out = String::new();
            for part in &parts {
                if part.get("type").and_then(serde_json::Value::as_str) == Some("text") {
                    if let Some(text) = part.get("text").and_then(serde_json::Value::as_str) {
                        out.push_str(text);
                    }
                }
            }
            Some(out)
        }
        _ => None,
    }
}

#[inline]
fn push_text(text: String, out: &mut UpstreamEvents) {
    if !text.is_empty() {
        out.push(UpstreamEvent::TextDelta(text));
    }
}

fn drop_line(line: &str, err: &serde_json::Error) {
    debug!(
        line = log_preview(line),
        error = %err,
        "dropping malformed upstream line"
    );
}
