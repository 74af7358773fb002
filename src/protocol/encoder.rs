//! Canonical event to downstream SSE frame serialization.

use crate::protocol::canonical::CanonicalEvent;
use crate::stream::sse::{done_frame, push_data_frame};
use crate::util::push_json_string_escaped;

/// Serialize one canonical event into a complete `data: ...\n\n` frame.
#[must_use]
pub fn encode(event: &CanonicalEvent) -> String {
    let mut out = String::with_capacity(64);
    encode_into(&mut out, event);
    out
}

/// Append the frame for `event` to `out`.
pub fn encode_into(out: &mut String, event: &CanonicalEvent) {
    let Some(kind) = event.wire_type() else {
        out.push_str(&done_frame());
        return;
    };

    let mut json = String::with_capacity(48);
    json.push_str("{\"type\":\"");
    json.push_str(kind);
    json.push('"');
    match event {
        CanonicalEvent::TextStart { id } | CanonicalEvent::TextEnd { id } => {
            push_field(&mut json, "id", id);
        }
        CanonicalEvent::TextDelta { id, delta } => {
            push_field(&mut json, "id", id);
            push_field(&mut json, "delta", delta);
        }
        CanonicalEvent::ToolCall { id, calls } => {
            push_field(&mut json, "id", id);
            json.push_str(",\"calls\":");
            // Vec<Value> serialization cannot fail.
            match serde_json::to_string(calls) {
                Ok(raw) => json.push_str(&raw),
                Err(_) => json.push_str("[]"),
            }
        }
        CanonicalEvent::Error { message } => {
            push_field(&mut json, "errorText", message);
        }
        CanonicalEvent::StreamStart
        | CanonicalEvent::StepStart
        | CanonicalEvent::StepFinish
        | CanonicalEvent::StreamFinish
        | CanonicalEvent::StreamDone => {}
    }
    json.push('}');
    push_data_frame(out, &json);
}

#[inline]
fn push_field(json: &mut String, name: &str, value: &str) {
    json.push_str(",\"");
    json.push_str(name);
    json.push_str("\":");
    push_json_string_escaped(json, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn payload(frame: &str) -> Value {
        let body = frame
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .expect("framed");
        serde_json::from_str(body).expect("json payload")
    }

    #[test]
    fn test_fixed_frames() {
        assert_eq!(encode(&CanonicalEvent::StreamStart), "data: {\"type\":\"start\"}\n\n");
        assert_eq!(encode(&CanonicalEvent::StepStart), "data: {\"type\":\"start-step\"}\n\n");
        assert_eq!(encode(&CanonicalEvent::StepFinish), "data: {\"type\":\"finish-step\"}\n\n");
        assert_eq!(encode(&CanonicalEvent::StreamFinish), "data: {\"type\":\"finish\"}\n\n");
        assert_eq!(encode(&CanonicalEvent::StreamDone), "data: [DONE]\n\n");
    }

    #[test]
    fn test_text_frames_carry_id() {
        let id: Arc<str> = Arc::from("msg-0000000000000001");
        assert_eq!(
            encode(&CanonicalEvent::TextStart { id: id.clone() }),
            "data: {\"type\":\"text-start\",\"id\":\"msg-0000000000000001\"}\n\n"
        );
        let delta = encode(&CanonicalEvent::TextDelta {
            id: id.clone(),
            delta: "say \"hi\"\n".to_string(),
        });
        assert_eq!(
            payload(&delta),
            json!({"type": "text-delta", "id": "msg-0000000000000001", "delta": "say \"hi\"\n"})
        );
        assert_eq!(
            payload(&encode(&CanonicalEvent::TextEnd { id })),
            json!({"type": "text-end", "id": "msg-0000000000000001"})
        );
    }

    #[test]
    fn test_tool_call_frame_embeds_calls_verbatim() {
        let calls = vec![json!({"index": 0, "id": "call_1", "function": {"name": "search", "arguments": "{\"q\":1}"}})];
        let frame = encode(&CanonicalEvent::ToolCall {
            id: Arc::from("m"),
            calls: calls.clone(),
        });
        assert_eq!(
            payload(&frame),
            json!({"type": "tool-call", "id": "m", "calls": calls})
        );
    }

    #[test]
    fn test_error_frame() {
        let frame = encode(&CanonicalEvent::Error {
            message: "upstream reset".to_string(),
        });
        assert_eq!(payload(&frame), json!({"type": "error", "errorText": "upstream reset"}));
    }
}
