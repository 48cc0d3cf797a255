//! Incremental Server-Sent-Events parsing with per-message timestamps.
//!
//! Chunks accumulate in one in-place buffer; complete messages are sliced
//! out by deleting through the delimiter rather than copying the remainder,
//! so peak memory stays about one message plus one chunk. Each message is
//! stamped with the perf timestamp of the chunk that completed it, which is
//! what makes TTFT and inter-token latencies trustworthy.

use crate::error::{AiperfError, Result};
use crate::models::record::SseMessage;

const CRLF_DELIMITER: &[u8] = b"\r\n\r\n";
const LF_DELIMITER: &[u8] = b"\n\n";

/// Stateful SSE framing over arbitrary chunk boundaries.
#[derive(Default)]
pub struct SseStreamReader {
    buffer: Vec<u8>,
}

impl SseStreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every message completed by it, each stamped
    /// with `chunk_perf_ns`.
    pub fn push_chunk(&mut self, chunk: &[u8], chunk_perf_ns: u64) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            // Spec-compliant CRLF CRLF first, bare LF LF as the lenient
            // fallback.
            let (index, delimiter_len) = match find(&self.buffer, CRLF_DELIMITER) {
                Some(index) => (index, CRLF_DELIMITER.len()),
                None => match find(&self.buffer, LF_DELIMITER) {
                    Some(index) => (index, LF_DELIMITER.len()),
                    None => break,
                },
            };

            let raw = String::from_utf8_lossy(&self.buffer[..index]).into_owned();
            // In-place removal of message + delimiter.
            self.buffer.drain(..index + delimiter_len);

            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            messages.push(SseMessage::parse(raw, chunk_perf_ns));
        }
        messages
    }

    /// Flush whatever remains after stream end. Some servers omit the final
    /// delimiter.
    pub fn finish(&mut self, perf_ns: u64) -> Option<SseMessage> {
        let raw = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(SseMessage::parse(raw, perf_ns))
    }
}

/// Raise when a message carries an `event: error` field: the comment field
/// is the error text when present, the raw message otherwise.
pub fn inspect_message_for_error(message: &SseMessage) -> Result<()> {
    if !message.has_error_event() {
        return Ok(());
    }
    let text = message
        .comment()
        .map(str::to_string)
        .unwrap_or_else(|| format!("unknown error in SSE response: {message:?}"));
    Err(AiperfError::SseResponse {
        code: 502,
        message: text,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
