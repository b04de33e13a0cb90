//! OpenAI-compatible chat completions (`/v1/chat/completions`).
//!
//! Implements both [`TextTransport`] (one request, one reply) and
//! [`StreamingTextTransport`] (SSE deltas).

use crate::config::TransportConfig;
use crate::error::{LipSyncError, Result};
use crate::transport::sse::SseLineParser;
use crate::transport::{
    ChatMessage, StreamingTextTransport, TextDeltaStream, TextTransport, api_endpoint,
    extract_error_message,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse one streamed `data:` payload into its text delta.
///
/// Returns `Ok(None)` for chunks without content (role headers, finish
/// markers, unparseable keep-alives) and an error for in-band error objects.
pub fn parse_chunk(data: &str) -> Result<Option<String>> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            warn!("skipping malformed stream chunk: {e}");
            return Ok(None);
        }
    };
    if value.get("error").is_some() {
        return Err(LipSyncError::Transport(extract_error_message(data)));
    }
    let chunk: ChunkResponse = serde_json::from_value(value).unwrap_or(ChunkResponse {
        choices: Vec::new(),
    });
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty()))
}

/// Chat client for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    config: TransportConfig,
    client: reqwest::Client,
}

impl OpenAiChat {
    /// Create a client from `config`.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Build the JSON request body.
    pub fn build_request(&self, history: &[ChatMessage], stream: bool) -> serde_json::Value {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.config.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend_from_slice(history);
        serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, history: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let url = api_endpoint(&self.config.api_url, "chat/completions");
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(%request_id, stream, messages = history.len(), "chat request");

        let mut request = self
            .client
            .post(&url)
            .header("X-Request-Id", &request_id)
            .json(&self.build_request(history, stream));
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LipSyncError::Transport(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LipSyncError::Transport(format!(
                "chat HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&body)
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TextTransport for OpenAiChat {
    async fn send_conversation(&self, history: &[ChatMessage]) -> Result<String> {
        let response = self.post(history, false).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LipSyncError::Transport(format!("invalid chat response: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LipSyncError::Transport("chat response had no content".into()))
    }
}

#[async_trait]
impl StreamingTextTransport for OpenAiChat {
    async fn stream_conversation(&self, history: &[ChatMessage]) -> Result<TextDeltaStream> {
        let response = self.post(history, true).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let stream = async_stream::stream! {
            let mut parser = SseLineParser::new();
            'read: loop {
                let (events, finished) = match bytes.next().await {
                    Some(Ok(chunk)) => (parser.push(&chunk), false),
                    Some(Err(e)) => {
                        yield Err(LipSyncError::Transport(format!("stream read error: {e}")));
                        break 'read;
                    }
                    None => (parser.flush().into_iter().collect(), true),
                };
                for event in events {
                    if event.is_done() {
                        break 'read;
                    }
                    match parse_chunk(&event.data) {
                        Ok(Some(delta)) => yield Ok(delta),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }
                if finished {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_with_content_yields_delta() {
        let data = r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_chunk(data).ok().flatten().as_deref(), Some("Hel"));
    }

    #[test]
    fn role_and_finish_chunks_yield_nothing() {
        let role = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        let finish = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert!(matches!(parse_chunk(role), Ok(None)));
        assert!(matches!(parse_chunk(finish), Ok(None)));
    }

    #[test]
    fn in_band_error_is_transport_error() {
        let data = r#"{"error":{"message":"context length exceeded"}}"#;
        match parse_chunk(data) {
            Err(LipSyncError::Transport(msg)) => assert_eq!(msg, "context length exceeded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn request_prepends_system_prompt() {
        let chat = OpenAiChat::new(TransportConfig {
            system_prompt: Some("Be brief.".into()),
            ..TransportConfig::default()
        });
        let body = chat.build_request(&[ChatMessage::user("hi")], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Be brief.");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["stream"], true);
    }
}
