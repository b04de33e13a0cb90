//! Configuration types for the lip-sync engine.

use crate::error::{LipSyncError, Result};
use crate::lipsync::source::SourceStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Signal analyzer settings (window, frame rate).
    pub analyzer: AnalyzerConfig,
    /// Loudness-to-mouth transfer function.
    pub mapper: MapperConfig,
    /// Synthetic animation used when no audio can be observed.
    pub fallback: FallbackConfig,
    /// Audio source acquisition.
    pub acquisition: AcquisitionConfig,
    /// Playback scheduling.
    pub playback: PlaybackConfig,
    /// Sentence splitting for streamed text.
    pub speech: SpeechConfig,
    /// Text-to-speech endpoint.
    pub tts: TtsConfig,
    /// Chat completion endpoint.
    pub transport: TransportConfig,
    /// Realtime audio session endpoint.
    pub realtime: RealtimeConfig,
    /// Renderer triggers fired around utterances.
    pub avatar: AvatarConfig,
}

/// Signal analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Time-domain window width in samples.
    pub window_size: usize,
    /// Animation frame rate driving the analyzer.
    pub frame_rate_hz: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            frame_rate_hz: 60,
        }
    }
}

/// Loudness-to-mouth transfer function.
///
/// `value = clamp(rms * rms_scale * weight, floor, ceiling)`, forced to zero
/// when the scaled RMS is at or below `silence_threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Empirical factor bringing speech RMS into a 0..1-ish range.
    pub rms_scale: f32,
    /// Gain applied to the scaled loudness.
    pub weight: f32,
    /// Minimum openness while any signal is present.
    pub floor: f32,
    /// Maximum openness.
    pub ceiling: f32,
    /// Scaled loudness at or below which the mouth is closed.
    pub silence_threshold: f32,
    /// Frames over which the mouth closes after natural completion.
    pub decay_frames: u32,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            rms_scale: 4.0,
            weight: 1.0,
            floor: 0.3,
            ceiling: 1.0,
            silence_threshold: 0.02,
            decay_frames: 6,
        }
    }
}

/// Synthetic oscillation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// How long the synthetic animation runs before closing the mouth.
    pub duration_ms: u64,
    /// Resting openness added under the oscillation.
    pub base: f32,
    /// Peak swing above `base`.
    pub amplitude: f32,
    /// Syllable-rate oscillation frequency.
    pub primary_hz: f32,
    /// Slower phrase-level modulation frequency.
    pub secondary_hz: f32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            duration_ms: 3000,
            base: 0.1,
            amplitude: 0.7,
            primary_hz: 4.0,
            secondary_hz: 0.7,
        }
    }
}

/// Audio source acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Strategy priority; providers are tried in this order.
    pub priority: Vec<SourceStrategy>,
    /// Upper bound on each acquisition attempt.
    pub attempt_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            priority: vec![
                SourceStrategy::Buffer,
                SourceStrategy::TransportTap,
                SourceStrategy::Environment,
                SourceStrategy::ScheduledCapture,
            ],
            attempt_timeout_ms: 4000,
        }
    }
}

/// Playback scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Minimum lead time before a newly scheduled chunk starts.
    pub min_lead_ms: u64,
    /// A live stream silent for this long reads as silence.
    pub stream_stale_ms: u64,
    /// Output sample rate for the speaker sink.
    pub output_sample_rate: u32,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_lead_ms: 50,
            stream_stale_ms: 250,
            output_sample_rate: 24_000,
            output_device: None,
        }
    }
}

/// Sentence splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Characters that end a playable chunk.
    pub terminators: Vec<char>,
    /// Completed chunks at or below this many characters are merged forward.
    pub min_chunk_chars: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            terminators: vec!['。', '、', '！', '？', '.', '!', '?', '\n'],
            min_chunk_chars: 3,
        }
    }
}

/// Text-to-speech endpoint (OpenAI-compatible `/v1/audio/speech`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL of the speech service.
    pub api_url: String,
    /// Speech model name.
    pub model: String,
    /// Voice preset.
    pub voice: String,
    /// Response audio format.
    pub response_format: String,
    /// Speaking speed multiplier.
    pub speed: f32,
    /// API key (empty = no auth header).
    pub api_key: String,
    /// Request timeout.
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            model: "tts-1".to_owned(),
            voice: "alloy".to_owned(),
            response_format: "wav".to_owned(),
            speed: 1.0,
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Chat completion endpoint (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL, with or without a trailing `/v1`.
    pub api_url: String,
    /// Model name.
    pub model: String,
    /// API key (empty = no auth header).
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// System prompt prepended to every conversation.
    pub system_prompt: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            api_key: String::new(),
            temperature: 0.7,
            max_tokens: 512,
            system_prompt: None,
        }
    }
}

/// Realtime bidirectional audio session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Model name sent in the setup message.
    pub model: String,
    /// API key appended as the `key` query parameter (empty = none).
    pub api_key: String,
    /// Sample rate of PCM16 audio sent to the session.
    pub input_sample_rate: u32,
    /// Sample rate of PCM16 audio received from the session.
    pub output_sample_rate: u32,
    /// Response modality requested in setup (`"AUDIO"` or `"TEXT"`).
    pub response_modality: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_owned(),
            model: "models/gemini-2.0-flash-exp".to_owned(),
            api_key: String::new(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            response_modality: "AUDIO".to_owned(),
        }
    }
}

/// A motion trigger on the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionTrigger {
    /// Motion group name.
    pub group: String,
    /// Index within the group.
    pub index: u32,
    /// Renderer priority.
    pub priority: u32,
}

/// Renderer triggers fired around utterances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Motion started when an utterance binds.
    pub speaking_motion: Option<MotionTrigger>,
    /// Expression set when an utterance binds.
    pub speaking_expression: Option<String>,
    /// Expression restored when the session returns to idle.
    pub idle_expression: Option<String>,
}

impl LipSyncConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| LipSyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| LipSyncError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/avatar-lipsync/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(dir) = std::env::var_os("LIPSYNC_CONFIG_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("avatar-lipsync"))
            .unwrap_or_else(|| PathBuf::from("/tmp/avatar-lipsync-config"))
            .join("config.toml")
    }

    /// Check value ranges that the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let m = &self.mapper;
        let f = &self.fallback;
        let numeric = [
            ("mapper.rms_scale", m.rms_scale),
            ("mapper.weight", m.weight),
            ("mapper.floor", m.floor),
            ("mapper.ceiling", m.ceiling),
            ("mapper.silence_threshold", m.silence_threshold),
            ("fallback.base", f.base),
            ("fallback.amplitude", f.amplitude),
            ("fallback.primary_hz", f.primary_hz),
            ("fallback.secondary_hz", f.secondary_hz),
        ];
        if let Some((name, value)) = numeric.iter().find(|(_, v)| !v.is_finite()) {
            return Err(LipSyncError::Config(format!("{name} must be finite, got {value}")));
        }
        let unit = 0.0f32..=1.0;
        if !unit.contains(&m.floor) || !unit.contains(&m.ceiling) {
            return Err(LipSyncError::Config(format!(
                "mapper.floor ({}) and mapper.ceiling ({}) must be within [0, 1]",
                m.floor, m.ceiling
            )));
        }
        if m.floor > m.ceiling {
            return Err(LipSyncError::Config(format!(
                "mapper.floor ({}) exceeds mapper.ceiling ({})",
                m.floor, m.ceiling
            )));
        }
        if m.weight <= 0.0 || m.rms_scale <= 0.0 {
            return Err(LipSyncError::Config(
                "mapper.weight and mapper.rms_scale must be positive".into(),
            ));
        }
        if m.silence_threshold < 0.0 {
            return Err(LipSyncError::Config(
                "mapper.silence_threshold must not be negative".into(),
            ));
        }
        if self.analyzer.window_size == 0 || self.analyzer.frame_rate_hz == 0 {
            return Err(LipSyncError::Config(
                "analyzer.window_size and analyzer.frame_rate_hz must be non-zero".into(),
            ));
        }
        if f.base < 0.0 || f.amplitude < 0.0 || f.primary_hz <= 0.0 {
            return Err(LipSyncError::Config(
                "fallback.base/amplitude must be non-negative and primary_hz positive".into(),
            ));
        }
        if self.acquisition.attempt_timeout_ms == 0 {
            return Err(LipSyncError::Config(
                "acquisition.attempt_timeout_ms must be non-zero".into(),
            ));
        }
        if self.speech.terminators.is_empty() {
            return Err(LipSyncError::Config(
                "speech.terminators must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LipSyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.analyzer.window_size, 256);
        assert_eq!(config.playback.min_lead_ms, 50);
        assert!(config.mapper.floor <= config.mapper.ceiling);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = LipSyncConfig::default();
        config.mapper.floor = 0.4;
        config.fallback.duration_ms = 1500;
        config.avatar.speaking_expression = Some("smile".into());

        config.save_to_file(&path).unwrap();
        let loaded = LipSyncConfig::from_file(&path).unwrap();
        assert!((loaded.mapper.floor - 0.4).abs() < f32::EPSILON);
        assert_eq!(loaded.fallback.duration_ms, 1500);
        assert_eq!(loaded.avatar.speaking_expression.as_deref(), Some("smile"));
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = LipSyncConfig::from_file(std::path::Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(matches!(
            LipSyncConfig::from_file(&path),
            Err(LipSyncError::Config(_))
        ));
    }

    #[test]
    fn partial_table_uses_defaults() {
        let toml_str = r#"
[mapper]
weight = 0.8
"#;
        let config: LipSyncConfig = toml::from_str(toml_str).unwrap();
        assert!((config.mapper.weight - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.mapper.decay_frames, 6);
        assert_eq!(config.acquisition.priority.len(), 4);
    }

    #[test]
    fn strategy_priority_deserializes() {
        let toml_str = r#"
[acquisition]
priority = ["scheduled_capture", "environment"]
attempt_timeout_ms = 3000
"#;
        let config: LipSyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.acquisition.priority,
            vec![SourceStrategy::ScheduledCapture, SourceStrategy::Environment]
        );
    }

    #[test]
    fn floor_above_ceiling_is_rejected() {
        let mut config = LipSyncConfig::default();
        config.mapper.floor = 0.9;
        config.mapper.ceiling = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn nan_values_are_rejected() {
        let mut config = LipSyncConfig::default();
        config.mapper.weight = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = LipSyncConfig::default();
        config.mapper.silence_threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = LipSyncConfig::default();
        config.fallback.secondary_hz = f32::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_weight_is_rejected() {
        let mut config = LipSyncConfig::default();
        config.mapper.weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_terminators_are_rejected() {
        let mut config = LipSyncConfig::default();
        config.speech.terminators.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = LipSyncConfig::default_config_path();
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
