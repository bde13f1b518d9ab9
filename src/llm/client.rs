use crate::error::{AskError, Result};
use crate::llm::sse::{SseDecoder, SseEvent};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, info};

pub const DEFAULT_MODEL: &str = "gpt-4-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// One incremental piece of a streamed reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatDelta {
    pub content: Option<String>,
    /// Set on the chunk that ends the reply ("stop", "length", ...).
    pub finish_reason: Option<String>,
}

impl ChatDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: None,
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            content: None,
            finish_reason: Some(reason.into()),
        }
    }
}

pub type DeltaStream = BoxStream<'static, Result<ChatDelta>>;

/// A chat model that answers a single system message with a token stream.
///
/// Implementations are shared read-only across concurrent runs.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn stream_chat(&self, system_prompt: &str) -> Result<DeltaStream>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, system_prompt: &str) -> Result<DeltaStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt}
            ],
            "stream": true,
        });

        info!("Streaming chat completion from {} ({} prompt chars)", self.model, system_prompt.len());

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AskError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AskError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        Ok(delta_stream(response.bytes_stream()))
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<DeltaBody>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Option<String>,
}

fn parse_chunk(payload: &str) -> Result<ChatDelta> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| AskError::Stream(format!("Malformed stream chunk: {}. Chunk: {}", e, payload)))?;

    if let Some(error) = chunk.error {
        return Err(AskError::Llm(format!("LLM API error: {}", error)));
    }

    // Usage-only chunks have no choices
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(ChatDelta::default());
    };

    Ok(ChatDelta {
        content: choice.delta.and_then(|d| d.content),
        finish_reason: choice.finish_reason,
    })
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<ChatDelta>>,
    done: bool,
}

impl<S> DecodeState<S> {
    fn enqueue(&mut self, events: impl IntoIterator<Item = SseEvent>) {
        for event in events {
            if self.done {
                break;
            }
            match event {
                SseEvent::Done => {
                    debug!("Stream sent [DONE]");
                    self.done = true;
                }
                SseEvent::Data(payload) => self.pending.push_back(parse_chunk(&payload)),
            }
        }
    }
}

/// Turn a raw SSE response body into a stream of deltas.
pub(crate) fn delta_stream<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(chunk.as_ref());
                    state.enqueue(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    state
                        .pending
                        .push_back(Err(AskError::Stream(format!("Stream read failed: {}", e))));
                }
                None => {
                    let trailing = state.decoder.finish();
                    state.enqueue(trailing);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, String>> + Send + 'static {
        let owned: Vec<std::result::Result<Vec<u8>, String>> =
            chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        futures_util::stream::iter(owned)
    }

    async fn collect(stream: DeltaStream) -> Vec<Result<ChatDelta>> {
        stream.collect().await
    }

    #[test]
    fn test_parse_chunk_content_and_finish() {
        let delta = parse_chunk(r#"{"choices":[{"index":0,"delta":{"content":"SEL"},"finish_reason":null}]}"#).unwrap();
        assert_eq!(delta, ChatDelta::text("SEL"));

        let delta = parse_chunk(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(delta, ChatDelta::finish("stop"));
    }

    #[test]
    fn test_parse_chunk_error_object() {
        let err = parse_chunk(r#"{"error":{"message":"rate limited"}}"#).unwrap_err();
        assert!(matches!(err, AskError::Llm(msg) if msg.contains("rate limited")));
    }

    #[test]
    fn test_parse_chunk_rejects_garbage() {
        assert!(matches!(parse_chunk("not json"), Err(AskError::Stream(_))));
    }

    #[tokio::test]
    async fn test_delta_stream_across_chunk_boundaries() {
        let stream = delta_stream(body(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"SELECT \"}}]}\n",
            "\ndata: {\"choices\":[{\"delta\":{\"con",
            "tent\":\"1\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]));

        let items: Vec<ChatDelta> = collect(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            items,
            vec![
                ChatDelta::text(""),
                ChatDelta::text("SELECT "),
                ChatDelta::text("1"),
                ChatDelta::finish("stop"),
            ]
        );
    }

    #[tokio::test]
    async fn test_delta_stream_stops_at_done() {
        let stream = delta_stream(body(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]));

        let items = collect(stream).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &ChatDelta::text("a"));
    }

    #[tokio::test]
    async fn test_delta_stream_surfaces_read_error() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_vec()),
            Err("connection reset".to_string()),
        ];
        let items = collect(delta_stream(futures_util::stream::iter(chunks))).await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(AskError::Stream(msg)) if msg.contains("connection reset")));
    }
}
