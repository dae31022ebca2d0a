//! localbridge proxy - Anthropic Messages API in front of a local model server.
//!
//! Clients speak Anthropic's `/v1/messages` API. This crate exposes a
//! compatible HTTP surface and translates requests and responses to the
//! OpenAI-style `chat/completions` format served by local engines such as
//! llama.cpp, Ollama or LM Studio.
//!
//! Design goals:
//! - Serialize access to a resource-constrained backend through a FIFO
//!   admission queue (`localbridge-queue`), one request at a time by default.
//! - Translate streamed backend output into Anthropic SSE events as it arrives.
//! - Always answer with a well-formed envelope, even when the backend fails or
//!   times out.

pub mod backend;
pub mod config;
pub mod error;
pub mod routing;
pub mod server;
pub mod sse;
pub mod streaming;
pub mod translation;
pub mod types;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use server::{configure, serve, AppState};
