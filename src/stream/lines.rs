//! Byte-chunk to logical-line reassembly.
//!
//! Upstream bodies arrive in arbitrary network chunks: a chunk may end in the
//! middle of a line, or in the middle of a multi-byte UTF-8 sequence. The
//! reassembler decodes with carry-over semantics and only releases complete
//! `\n`-terminated lines; the trailing fragment stays buffered until the next
//! chunk or [`LineReassembler::flush`].

use memchr::memchr_iter;

/// Incremental line splitter over a UTF-8 byte stream.
///
/// Malformed byte sequences are replaced with U+FFFD rather than failing the
/// stream. A trailing `\r` is stripped from every line.
#[derive(Debug, Default)]
pub struct LineReassembler {
    // Tail of an incomplete UTF-8 sequence (at most 3 bytes).
    pending_bytes: Vec<u8>,
    // Decoded text of the current partial line.
    buffer: String,
}

impl LineReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed one chunk and append completed lines into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        self.decode_into_buffer(chunk);
        self.drain_complete_lines(out);
    }

    /// Return the final, possibly unterminated, line once the upstream ended.
    ///
    /// An incomplete UTF-8 tail is decoded lossily. Returns `None` when
    /// nothing is buffered.
    pub fn flush(&mut self) -> Option<String> {
        if !self.pending_bytes.is_empty() {
            let tail = std::mem::take(&mut self.pending_bytes);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        if self.buffer.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buffer);
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// Bytes currently held back, decoded or not.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending_bytes.len()
    }

    fn decode_into_buffer(&mut self, chunk: &[u8]) {
        let joined: Vec<u8>;
        let mut input: &[u8] = if self.pending_bytes.is_empty() {
            chunk
        } else {
            self.pending_bytes.extend_from_slice(chunk);
            joined = std::mem::take(&mut self.pending_bytes);
            &joined
        };

        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&input[..valid_up_to]) {
                        self.buffer.push_str(text);
                    }
                    match err.error_len() {
                        Some(invalid_len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            input = &input[valid_up_to + invalid_len..];
                        }
                        None => {
                            // Sequence cut by the chunk boundary; finish it next feed.
                            self.pending_bytes.extend_from_slice(&input[valid_up_to..]);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_complete_lines(&mut self, out: &mut Vec<String>) {
        let mut line_start = 0usize;
        for line_end in memchr_iter(b'\n', self.buffer.as_bytes()) {
            let line = &self.buffer[line_start..line_end];
            out.push(line.strip_suffix('\r').unwrap_or(line).to_owned());
            line_start = line_end + 1;
        }
        if line_start > 0 {
            self.buffer.drain(..line_start);
        }
    }
}
