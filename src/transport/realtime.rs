//! Realtime bidirectional audio session over WebSocket.
//!
//! Speaks a Live-API style JSON protocol: a `setup` message on connect,
//! `clientContent` turns for text, `realtimeInput.mediaChunks` for
//! microphone audio, and `serverContent` messages carrying reply text,
//! base64 PCM16 audio, `turnComplete`, and `interrupted`.

use crate::audio::AudioFrame;
use crate::config::RealtimeConfig;
use crate::error::{LipSyncError, Result};
use crate::transport::{RealtimeEvent, RealtimeTransport};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Build the connection URL, adding the API key as the `key` parameter.
///
/// # Errors
///
/// Returns [`LipSyncError::Config`] if the configured URL is invalid.
pub fn session_url(config: &RealtimeConfig) -> Result<url::Url> {
    let mut url = url::Url::parse(&config.url)
        .map_err(|e| LipSyncError::Config(format!("invalid realtime url: {e}")))?;
    if !config.api_key.is_empty() {
        url.query_pairs_mut().append_pair("key", &config.api_key);
    }
    Ok(url)
}

/// The first message sent after connecting.
pub fn setup_message(config: &RealtimeConfig) -> serde_json::Value {
    serde_json::json!({
        "setup": {
            "model": config.model,
            "generationConfig": {
                "responseModalities": [config.response_modality],
            },
        }
    })
}

/// A complete user text turn.
pub fn text_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{ "role": "user", "parts": [{ "text": text }] }],
            "turnComplete": true,
        }
    })
}

/// One chunk of streamed microphone audio.
pub fn audio_message(frame: &AudioFrame) -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format!("audio/pcm;rate={}", frame.sample_rate),
                "data": BASE64.encode(frame.to_pcm16_le()),
            }]
        }
    })
}

/// Parse one server message into events, in protocol order.
///
/// Audio parts are decoded as PCM16 at the rate named in their mime type,
/// or `default_rate` when none is given. Unknown messages yield nothing.
pub fn parse_server_message(text: &str, default_rate: u32) -> Vec<RealtimeEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return vec![RealtimeEvent::Error(format!("malformed server message: {e}"))],
    };
    if value.get("setupComplete").is_some() {
        debug!("realtime setup complete");
        return Vec::new();
    }
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string());
        return vec![RealtimeEvent::Error(message)];
    }
    let Some(content) = value.get("serverContent") else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
        events.push(RealtimeEvent::Interrupted);
    }
    let parts = content
        .pointer("/modelTurn/parts")
        .and_then(|p| p.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            events.push(RealtimeEvent::TextDelta(text.to_owned()));
        }
        if let Some(inline) = part.get("inlineData") {
            events.push(decode_inline_audio(inline, default_rate));
        }
    }
    if let Some(text) = content
        .pointer("/outputTranscription/text")
        .and_then(|t| t.as_str())
    {
        events.push(RealtimeEvent::TextDelta(text.to_owned()));
    }
    if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
        events.push(RealtimeEvent::TurnComplete);
    }
    events
}

fn decode_inline_audio(inline: &serde_json::Value, default_rate: u32) -> RealtimeEvent {
    let rate = inline
        .get("mimeType")
        .and_then(|m| m.as_str())
        .and_then(|m| m.split(';').find_map(|p| p.trim().strip_prefix("rate=")))
        .and_then(|r| r.parse().ok())
        .unwrap_or(default_rate);
    let data = inline.get("data").and_then(|d| d.as_str()).unwrap_or_default();
    match BASE64.decode(data) {
        Ok(bytes) => RealtimeEvent::Audio(AudioFrame::from_pcm16_le(&bytes, rate)),
        Err(e) => RealtimeEvent::Error(format!("invalid inline audio: {e}")),
    }
}

/// A connected realtime session.
///
/// Exposes no audio tap: reply audio arrives as [`RealtimeEvent::Audio`]
/// and is scheduled by the caller.
#[derive(Debug)]
pub struct RealtimeSession {
    outbound: mpsc::UnboundedSender<String>,
    events: Mutex<Option<mpsc::Receiver<RealtimeEvent>>>,
    cancel: CancellationToken,
}

impl RealtimeSession {
    /// Connect and send the setup message.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Transport`] if the connection or setup fails.
    pub async fn connect(config: &RealtimeConfig) -> Result<Self> {
        let url = session_url(config)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| LipSyncError::Transport(format!("realtime connect failed: {e}")))?;
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(setup_message(config).to_string()))
            .await
            .map_err(|e| LipSyncError::Transport(format!("realtime setup failed: {e}")))?;
        info!(model = %config.model, "realtime session connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let output_rate = config.output_sample_rate;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = read.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                Ok(text) => text,
                                Err(_) => continue,
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!("realtime read error: {e}");
                                let _ = events_tx.send(RealtimeEvent::Error(e.to_string())).await;
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };
                        for event in parse_server_message(&text, output_rate) {
                            if events_tx.send(event).await.is_err() {
                                debug!("realtime event receiver dropped");
                            }
                        }
                    }
                    Some(json) = outbound_rx.recv() => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            warn!("realtime send error: {e}");
                            let _ = events_tx.send(RealtimeEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                }
            }
            let _ = events_tx.send(RealtimeEvent::Closed).await;
            info!("realtime session closed");
        });

        Ok(Self {
            outbound,
            events: Mutex::new(Some(events_rx)),
            cancel,
        })
    }

    fn send_json(&self, value: &serde_json::Value) -> Result<()> {
        self.outbound
            .send(value.to_string())
            .map_err(|_| LipSyncError::Transport("realtime session is closed".into()))
    }
}

#[async_trait]
impl RealtimeTransport for RealtimeSession {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.send_json(&text_message(text))
    }

    fn send_audio_chunk(&self, frame: &AudioFrame) {
        if let Err(e) = self.send_json(&audio_message(frame)) {
            debug!("dropping microphone chunk: {e}");
        }
    }

    fn events(&self) -> Option<mpsc::Receiver<RealtimeEvent>> {
        self.events.lock().ok().and_then(|mut e| e.take())
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
