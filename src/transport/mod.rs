//! Chat transports: one-shot text, streaming text, and realtime audio.
//!
//! The conversation layer only sees these traits. Implementations expose
//! audio to the lip-sync engine through the narrow [`RealtimeTransport::audio_tap`]
//! contract and nothing else.

pub mod openai;
pub mod realtime;
pub mod sse;

pub use openai::OpenAiChat;
pub use realtime::{RealtimeSession, parse_server_message};

use crate::audio::AudioFrame;
use crate::audio::stream::LiveAudio;
use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::sync::mpsc;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Finite stream of reply text deltas. Ends with the turn.
pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One request, one complete reply.
#[async_trait]
pub trait TextTransport: Send + Sync {
    /// Send the history and return the assistant's reply.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Transport`](crate::error::LipSyncError::Transport).
    async fn send_conversation(&self, history: &[ChatMessage]) -> Result<String>;
}

/// One request, a stream of reply deltas.
#[async_trait]
pub trait StreamingTextTransport: Send + Sync {
    /// Send the history and stream the reply.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Transport`](crate::error::LipSyncError::Transport)
    /// if the request fails; failures mid-stream arrive as `Err` items.
    async fn stream_conversation(&self, history: &[ChatMessage]) -> Result<TextDeltaStream>;
}

/// Something received on a realtime session.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// Reply transcript text.
    TextDelta(String),
    /// Reply audio.
    Audio(AudioFrame),
    /// The model finished its turn.
    TurnComplete,
    /// The model's turn was cut off (barge-in).
    Interrupted,
    /// The session ended.
    Closed,
    /// A protocol or connection error.
    Error(String),
}

/// Bidirectional realtime session.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Send a user text turn.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Transport`](crate::error::LipSyncError::Transport)
    /// if the session is closed.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Stream microphone audio. Fire-and-forget.
    fn send_audio_chunk(&self, frame: &AudioFrame);

    /// Take the event receiver. Returns `None` after the first call.
    fn events(&self) -> Option<mpsc::Receiver<RealtimeEvent>>;

    /// Live reply audio, if this transport exposes it.
    fn audio_tap(&self) -> Option<LiveAudio> {
        None
    }

    /// Close the session.
    async fn close(&self);
}

/// Join `path` onto an API base URL that may or may not end in `/v1`.
pub(crate) fn api_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/{path}")
}

/// Pull `error.message` out of an OpenAI-style error body.
pub(crate) fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_owned())
}
