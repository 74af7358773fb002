//! SSE (Server-Sent Events) framing helpers for the downstream wire.
//!
//! The downstream consumer reads unnamed `data:` frames separated by a blank
//! line, and a literal `[DONE]` payload as the terminator.

pub const DONE_PAYLOAD: &str = "[DONE]";
const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Format an unnamed SSE frame around an already-serialized JSON payload.
#[must_use]
pub fn data_frame(json: &str) -> String {
    let mut out = String::with_capacity(8 + json.len());
    push_data_frame(&mut out, json);
    out
}

/// Append an unnamed SSE frame to `out`.
#[inline]
pub fn push_data_frame(out: &mut String, json: &str) {
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
}

/// Format the `[DONE]` terminator frame.
#[must_use]
pub fn done_frame() -> String {
    DONE_FRAME.to_owned()
}

/// Whether an SSE `data:` payload is the `[DONE]` sentinel.
#[must_use]
pub fn is_done_payload(payload: &str) -> bool {
    payload.trim() == DONE_PAYLOAD
}

/// Strip the `data:` field name from an SSE line, returning the trimmed payload.
///
/// Accepts both `data: x` and `data:x`. Returns `None` for any other field.
#[must_use]
pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame() {
        assert_eq!(data_frame("{\"type\":\"start\"}"), "data: {\"type\":\"start\"}\n\n");
    }

    #[test]
    fn test_done_frame_string() {
        assert_eq!(done_frame(), "data: [DONE]\n\n");
    }

    #[test]
    fn test_is_done_payload() {
        assert!(is_done_payload("[DONE]"));
        assert!(is_done_payload(" [DONE] "));
        assert!(!is_done_payload("{\"content\":\"[DONE]\"}"));
    }

    #[test]
    fn test_sse_data_payload_with_and_without_space() {
        assert_eq!(sse_data_payload("data: {}"), Some("{}"));
        assert_eq!(sse_data_payload("data:{}"), Some("{}"));
        assert_eq!(sse_data_payload("event: ping"), None);
        assert_eq!(sse_data_payload("0:\"x\""), None);
    }
}
