//! Streaming conversion (SSE).
//!
//! The backend streams OpenAI-style `data: {json}` frames ending with
//! `data: [DONE]`. Callers expect Anthropic-style events. Every stream the
//! proxy produces has exactly this shape:
//!
//! ```text
//! message_start
//! content_block_start   (index 0, text)
//! content_block_delta*  (one per non-empty backend fragment)
//! content_block_stop
//! message_stop
//! ```
//!
//! The shape holds when the backend fails, times out, or the job never runs:
//! the failure description is sent as a final text delta instead.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::backend::BackendClient;
use crate::error::ProxyError;
use crate::sse::{BackendEvent, SseDecoder};
use crate::types::ChatCompletionRequest;

const ABANDONED_TEXT: &str = "[localbridge] request was dropped before the backend responded";

/// Per-request streaming state. Owned by exactly one request.
///
/// Dropping an unfinished session finishes it with an "abandoned" notice, so
/// the outbound stream is always terminated with a complete envelope.
#[derive(Debug)]
pub struct TranslationSession {
    tx: UnboundedSender<Bytes>,
    message_id: String,
    model: String,
    opened: bool,
    finished: bool,
}

impl TranslationSession {
    pub fn new(tx: UnboundedSender<Bytes>, message_id: String, model: String) -> Self {
        Self {
            tx,
            message_id,
            model,
            opened: false,
            finished: false,
        }
    }

    /// True once the receiving side (the HTTP response body) is gone.
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }

    /// Emit `message_start` and `content_block_start`. Idempotent.
    pub fn open(&mut self) {
        if self.opened {
            return;
        }
        self.opened = true;
        self.emit(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        );
        self.emit(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""}
            }),
        );
    }

    /// Emit one text fragment. Empty fragments are skipped.
    pub fn delta(&mut self, text: &str) {
        if text.is_empty() || self.finished {
            return;
        }
        self.open();
        self.emit(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            }),
        );
    }

    /// Close the envelope, reporting `error` as a final text fragment.
    /// Only the first call has an effect.
    pub fn finish(&mut self, error: Option<&ProxyError>) {
        self.finish_with(error.map(ProxyError::describe).as_deref());
    }

    fn finish_with(&mut self, notice: Option<&str>) {
        if self.finished {
            return;
        }
        self.open();
        if let Some(notice) = notice {
            self.delta(notice);
        }
        self.finished = true;
        self.emit(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": 0}),
        );
        self.emit("message_stop", &json!({"type": "message_stop"}));
    }

    fn emit(&self, event: &str, data: &Value) {
        // A closed receiver means the client went away; nothing left to do.
        let _ = self.tx.send(Bytes::from(sse_event(event, data)));
    }
}

impl Drop for TranslationSession {
    fn drop(&mut self) {
        if !self.finished {
            self.finish_with(Some(ABANDONED_TEXT));
        }
    }
}

/// Result of a streaming job: the session to finish and what went wrong, if anything.
#[derive(Debug)]
pub struct StreamOutcome {
    pub session: TranslationSession,
    pub result: Result<(), ProxyError>,
}

impl StreamOutcome {
    /// Write the terminal events. Called after the queue slot is released.
    pub fn finish(mut self) {
        self.session.finish(self.result.as_ref().err());
    }
}

/// Body of a queued streaming job: relay backend fragments into `session`.
///
/// The whole exchange, from issuing the request to the last byte of the body,
/// is bounded by the backend timeout. Hitting it drops the response, which
/// closes the backend connection.
pub async fn relay_stream(
    backend: BackendClient,
    request: ChatCompletionRequest,
    mut session: TranslationSession,
) -> StreamOutcome {
    let result = tokio::time::timeout(
        backend.timeout(),
        pump_backend_stream(&backend, &request, &mut session),
    )
    .await
    .unwrap_or_else(|_| {
        warn!(
            timeout_ms = backend.timeout_ms(),
            model = %request.model,
            "backend stream timed out"
        );
        Err(backend.timeout_error())
    });

    if let Err(e) = &result {
        warn!(error = %e, "streaming request failed");
    }

    StreamOutcome { session, result }
}

async fn pump_backend_stream(
    backend: &BackendClient,
    request: &ChatCompletionRequest,
    session: &mut TranslationSession,
) -> Result<(), ProxyError> {
    let response = backend.open_stream(request).await?;
    session.open();

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        decoder.feed(&chunk?);
        while let Some(event) = decoder.next_event() {
            if forward_event(event, session) {
                return Ok(());
            }
        }
        if session.is_detached() {
            debug!("client disconnected, abandoning backend stream");
            return Ok(());
        }
    }

    if let Some(event) = decoder.finish() {
        forward_event(event, session);
    }
    Ok(())
}

/// Forward one decoded frame. Returns true when the backend signalled the end
/// of the stream.
fn forward_event(event: BackendEvent, session: &mut TranslationSession) -> bool {
    match event {
        BackendEvent::Done => true,
        BackendEvent::Chunk(chunk) => {
            if let Some(text) = chunk.delta_text() {
                session.delta(text);
            }
            chunk.finish_reason().is_some()
        }
    }
}

/// Format one outbound SSE frame: `event: <type>\ndata: <json>\n\n`.
pub fn sse_event(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}
