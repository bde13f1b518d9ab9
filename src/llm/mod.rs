//! LLM Module - streaming chat-completion client
//!
//! - `ChatModel` trait: one system prompt in, a stream of deltas out
//! - `OpenAiClient`: chat completions over HTTP with `stream: true`
//! - `sse`: incremental Server-Sent-Events decoding of the response body

pub mod client;
pub mod sse;

pub use client::{ChatDelta, ChatModel, DeltaStream, OpenAiClient, DEFAULT_BASE_URL, DEFAULT_MODEL};
pub use sse::{SseDecoder, SseEvent};
