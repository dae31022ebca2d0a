//! Anthropic -> backend request translation and response envelopes.
//!
//! The backend only understands flat role/text pairs, so structured content is
//! flattened: text parts are joined with newlines and everything else (images,
//! tool blocks) is dropped.

use crate::types::{
    ChatCompletionRequest, ChatMessage, MessagesRequest, MessagesResponse, ResponseBlock, Role,
    Usage,
};

/// Stop reason reported on every envelope the proxy produces.
pub const END_TURN: &str = "end_turn";

/// Flatten an Anthropic request into the backend's ordered message list.
///
/// The system prompt, when present and non-empty, becomes a leading
/// `system` message.
pub fn flatten_request(req: &MessagesRequest) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        let system_text = system.to_plaintext();
        if !system_text.is_empty() {
            out.push(ChatMessage::new("system", system_text));
        }
    }

    for msg in &req.messages {
        out.push(ChatMessage::new(role_str(msg.role), msg.content.to_plaintext()));
    }

    out
}

/// Build the backend request for an already selected model.
pub fn build_chat_request(req: &MessagesRequest, model: &str, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: flatten_request(req),
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        stream,
    }
}

/// Text used for model selection: the most recent user turn, or the whole
/// conversation when there is none.
pub fn prompt_text(req: &MessagesRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.to_plaintext())
        .unwrap_or_else(|| {
            req.messages
                .iter()
                .map(|m| m.content.to_plaintext())
                .collect::<Vec<_>>()
                .join("\n")
        })
}

/// Wrap a block of text in a single `/v1/messages` response envelope.
pub fn message_response(id: String, model: String, text: String, usage: Usage) -> MessagesResponse {
    MessagesResponse {
        id,
        kind: "message".to_string(),
        role: Role::Assistant,
        model,
        content: vec![ResponseBlock::Text { text }],
        stop_reason: Some(END_TURN.to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Fresh Anthropic-style message id.
pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}
