//! Incremental decoder for the backend's SSE stream.
//!
//! OpenAI-compatible servers frame each event as one or more `data: <json>`
//! lines followed by a blank line, and finish with `data: [DONE]`. Transport
//! chunks can split a frame (or a multi-byte character) anywhere, so bytes are
//! buffered until a full frame is available.

use tracing::debug;

use crate::types::ChatCompletionChunk;

const DONE_SENTINEL: &str = "[DONE]";

/// Largest frame the decoder will buffer. Bytes of a longer frame are
/// discarded up to its closing blank line.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Longest delimiter (`\r\n\r\n`) minus one: how far back a search resumes so
/// a delimiter split across chunks is still found.
const DELIMITER_OVERLAP: usize = 3;

/// A decoded backend frame.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Chunk(ChatCompletionChunk),
    Done,
}

/// Pull-based SSE frame decoder: [`feed`](Self::feed) raw bytes, then drain
/// with [`next_event`](Self::next_event) until it returns `None`.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched without finding a delimiter.
    scanned: usize,
    max_frame_bytes: usize,
    /// Inside an oversized frame whose start has been thrown away.
    discarding: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_bytes: max_frame_bytes.max(DELIMITER_OVERLAP + 1),
            discarding: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete, parseable frame. Frames whose payload is not valid JSON
    /// are logged and skipped.
    pub fn next_event(&mut self) -> Option<BackendEvent> {
        while let Some(frame) = self.take_frame() {
            if let Some(event) = parse_frame(&frame) {
                return Some(event);
            }
        }
        None
    }

    /// Decode whatever is left once the body has ended, for servers that do
    /// not terminate the last frame with a blank line.
    pub fn finish(&mut self) -> Option<BackendEvent> {
        if let Some(event) = self.next_event() {
            return Some(event);
        }
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) || rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        parse_frame(&rest)
    }

    /// Bytes buffered but not yet decoded.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = self.scanned.saturating_sub(DELIMITER_OVERLAP);
            let Some((offset, delimiter_len)) = find_frame_end(&self.buffer[start..]) else {
                self.scanned = self.buffer.len();
                self.shed_oversized_frame();
                return None;
            };

            let end = start + offset;
            let frame = self.buffer[..end].to_vec();
            self.buffer.drain(..end + delimiter_len);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            return Some(frame);
        }
    }

    /// Drop the buffered head of a frame that has outgrown the limit, keeping
    /// only the bytes that could begin its closing delimiter.
    fn shed_oversized_frame(&mut self) {
        if self.buffer.len() <= self.max_frame_bytes {
            return;
        }
        if !self.discarding {
            debug!(
                limit = self.max_frame_bytes,
                "dropping oversized backend SSE frame"
            );
            self.discarding = true;
        }
        let keep_from = self.buffer.len() - DELIMITER_OVERLAP;
        self.buffer.drain(..keep_from);
        self.scanned = self.buffer.len();
    }
}

/// Position and length of the first blank-line delimiter.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buf, b"\n\n").map(|i| (i, 2));
    let crlf = find(buf, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_frame(frame: &[u8]) -> Option<BackendEvent> {
    let text = String::from_utf8_lossy(frame);
    let data_lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();

    if data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Some(BackendEvent::Done);
    }

    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => Some(BackendEvent::Chunk(chunk)),
        Err(e) => {
            debug!(error = %e, payload = %data, "dropping malformed backend SSE frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut SseDecoder) -> Vec<BackendEvent> {
        std::iter::from_fn(|| decoder.next_event()).collect()
    }

    fn texts(events: &[BackendEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                BackendEvent::Chunk(c) => c.delta_text().map(str::to_string),
                BackendEvent::Done => None,
            })
            .collect()
    }

    const STREAM: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Héllo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" wörld\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    #[test]
    fn test_decodes_frames_and_done() {
        let mut decoder = SseDecoder::new();
        decoder.feed(STREAM.as_bytes());
        let events = drain(&mut decoder);

        assert_eq!(texts(&events), vec!["Héllo", " wörld"]);
        assert!(matches!(events.last(), Some(BackendEvent::Done)));
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_split_at_every_byte_boundary_matches_single_chunk() {
        let bytes = STREAM.as_bytes();
        let mut whole = SseDecoder::new();
        whole.feed(bytes);
        let expected = texts(&drain(&mut whole));

        for split in 1..bytes.len() {
            let mut decoder = SseDecoder::new();
            decoder.feed(&bytes[..split]);
            let mut events = drain(&mut decoder);
            decoder.feed(&bytes[split..]);
            events.extend(drain(&mut decoder));

            assert_eq!(texts(&events), expected, "split at byte {split}");
            assert!(matches!(events.last(), Some(BackendEvent::Done)));
        }
    }

    #[test]
    fn test_partial_frame_is_held_back() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n");
        assert!(decoder.next_event().is_none());
        decoder.feed(b"\n");
        assert_eq!(texts(&drain(&mut decoder)), vec!["a"]);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: {not json\n\n");
        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n");
        assert_eq!(texts(&drain(&mut decoder)), vec!["ok"]);
    }

    #[test]
    fn test_crlf_delimiters_and_comments() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b": keep-alive\r\n\r\n");
        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n\r\n");
        decoder.feed(b"data:[DONE]\r\n\r\n");

        let events = drain(&mut decoder);
        assert_eq!(texts(&events), vec!["x"]);
        assert!(matches!(events.last(), Some(BackendEvent::Done)));
    }

    #[test]
    fn test_byte_at_a_time_feed() {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for byte in STREAM.replace("\n\n", "\r\n\r\n").as_bytes() {
            decoder.feed(std::slice::from_ref(byte));
            events.extend(drain(&mut decoder));
        }

        assert_eq!(texts(&events), vec!["Héllo", " wörld"]);
        assert!(matches!(events.last(), Some(BackendEvent::Done)));
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_oversized_frame_is_dropped_and_buffer_stays_bounded() {
        let mut decoder = SseDecoder::with_max_frame_bytes(64);
        let huge = format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n",
            "x".repeat(500)
        );
        for chunk in huge.as_bytes().chunks(7) {
            decoder.feed(chunk);
            assert!(decoder.next_event().is_none());
            assert!(decoder.pending_len() <= 64 + 7);
        }

        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"next\"}}]}\n\n");
        assert_eq!(texts(&drain(&mut decoder)), vec!["next"]);
    }

    #[test]
    fn test_finish_discards_unterminated_oversized_frame() {
        let mut decoder = SseDecoder::with_max_frame_bytes(16);
        decoder.feed(format!("data: {}", "y".repeat(100)).as_bytes());
        assert!(decoder.next_event().is_none());
        assert!(decoder.finish().is_none());
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}");
        assert!(decoder.next_event().is_none());

        let events: Vec<_> = decoder.finish().into_iter().collect();
        assert_eq!(texts(&events), vec!["tail"]);
        assert!(decoder.finish().is_none());
    }
}
