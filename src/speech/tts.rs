//! Text-to-speech boundary.

use crate::config::TtsConfig;
use crate::error::{LipSyncError, Result};
use crate::transport::{api_endpoint, extract_error_message};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// Turns text into an encoded audio payload.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Synthesis`] when the engine fails.
    async fn synthesize(&self, text: &str) -> Result<Bytes>;

    /// Container format of the returned payload, used as a decode hint.
    fn format_hint(&self) -> Option<&str> {
        None
    }
}

/// Synthesizer backed by an OpenAI-compatible `/v1/audio/speech` endpoint.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    config: TtsConfig,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    /// Create a synthesizer from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Config`] if the HTTP client cannot be built.
    pub fn new(config: TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| LipSyncError::Config(format!("failed to build TTS client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Build the JSON request body for `text`.
    pub fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "input": text,
            "voice": self.config.voice,
            "response_format": self.config.response_format,
            "speed": self.config.speed,
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let url = api_endpoint(&self.config.api_url, "audio/speech");
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(%request_id, chars = text.chars().count(), "requesting speech");

        let mut request = self
            .client
            .post(&url)
            .header("X-Request-Id", &request_id)
            .json(&self.request_body(text));
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LipSyncError::Synthesis(format!("speech request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LipSyncError::Synthesis(format!(
                "speech HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&body)
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| LipSyncError::Synthesis(format!("speech body read failed: {e}")))?;
        if audio.is_empty() {
            return Err(LipSyncError::Synthesis("speech service returned no audio".into()));
        }
        debug!(%request_id, bytes = audio.len(), "speech received");
        Ok(audio)
    }

    fn format_hint(&self) -> Option<&str> {
        Some(&self.config.response_format)
    }
}
