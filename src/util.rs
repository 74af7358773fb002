use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static MESSAGE_ID_SEED: LazyLock<u64> = LazyLock::new(|| fastrand::u64(..));
const HEX: &[u8; 16] = b"0123456789abcdef";
const LOG_PREVIEW_MAX_CHARS: usize = 120;

#[inline]
pub(crate) fn mix_u64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Opaque per-turn id correlating every text event of one assistant message.
#[inline]
pub(crate) fn next_message_id() -> String {
    let seq = MESSAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format_request_seq_hex("msg-", mix_u64(*MESSAGE_ID_SEED ^ seq))
}

#[inline]
pub(crate) fn format_request_seq_hex(prefix: &str, request_seq: u64) -> String {
    let mut out = String::with_capacity(prefix.len() + 16);
    out.push_str(prefix);
    push_u64_hex_16(&mut out, request_seq);
    out
}

#[inline]
pub(crate) fn push_json_string_escaped(out: &mut String, value: &str) {
    let bytes = value.as_bytes();
    if bytes.iter().all(|&b| b >= 0x20 && b != b'"' && b != b'\\') {
        out.push('"');
        out.push_str(value);
        out.push('"');
        return;
    }

    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c <= '\u{1f}' => {
                let control = c as u8;
                out.push_str("\\u00");
                out.push(char::from(HEX[(control >> 4) as usize]));
                out.push(char::from(HEX[(control & 0x0f) as usize]));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Char-boundary-safe prefix of `text` for log lines.
#[must_use]
pub(crate) fn log_preview(text: &str) -> &str {
    match text.char_indices().nth(LOG_PREVIEW_MAX_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
