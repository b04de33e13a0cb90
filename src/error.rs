//! Error types for the lip-sync engine.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) accessible
//! via [`LipSyncError::code()`]. Audio-path failures are contained locally by
//! the engine (skip the chunk or fall back to synthetic animation); transport
//! failures are surfaced to the caller.

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// No capturable audio signal could be bound.
    pub const SOURCE_UNAVAILABLE: &str = "SOURCE_UNAVAILABLE";

    /// Audio payload could not be decoded.
    pub const DECODE_ERROR: &str = "DECODE_ERROR";

    /// Speech synthesis call failed.
    pub const SYNTHESIS_FAILURE: &str = "SYNTHESIS_FAILURE";

    /// Chat or realtime session call failed.
    pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";

    /// Audio output failed.
    pub const PLAYBACK_ERROR: &str = "PLAYBACK_ERROR";

    /// Invalid configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// Internal channel closed unexpectedly.
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";

    /// Filesystem error.
    pub const IO_ERROR: &str = "IO_ERROR";
}

/// Top-level error type for the lip-sync engine.
#[derive(Debug, thiserror::Error)]
pub enum LipSyncError {
    /// No capturable audio signal (permission denied, unsupported, nothing live).
    #[error("[{}] {}", error_codes::SOURCE_UNAVAILABLE, .0)]
    SourceUnavailable(String),

    /// Malformed or unsupported audio payload.
    #[error("[{}] {}", error_codes::DECODE_ERROR, .0)]
    Decode(String),

    /// Text-to-speech request failed.
    #[error("[{}] {}", error_codes::SYNTHESIS_FAILURE, .0)]
    Synthesis(String),

    /// Chat / realtime transport failure.
    #[error("[{}] {}", error_codes::TRANSPORT_ERROR, .0)]
    Transport(String),

    /// Audio output device or stream error.
    #[error("[{}] {}", error_codes::PLAYBACK_ERROR, .0)]
    Playback(String),

    /// Configuration error.
    #[error("[{}] {}", error_codes::CONFIG_INVALID, .0)]
    Config(String),

    /// Channel send/receive error.
    #[error("[{}] {}", error_codes::CHANNEL_CLOSED, .0)]
    Channel(String),

    /// I/O error.
    #[error("[{}] {}", error_codes::IO_ERROR, .0)]
    Io(#[from] std::io::Error),
}

impl LipSyncError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => error_codes::SOURCE_UNAVAILABLE,
            Self::Decode(_) => error_codes::DECODE_ERROR,
            Self::Synthesis(_) => error_codes::SYNTHESIS_FAILURE,
            Self::Transport(_) => error_codes::TRANSPORT_ERROR,
            Self::Playback(_) => error_codes::PLAYBACK_ERROR,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Channel(_) => error_codes::CHANNEL_CLOSED,
            Self::Io(_) => error_codes::IO_ERROR,
        }
    }

    /// Whether this failure belongs to the audio path and is handled by
    /// degrading (skip the chunk, use the fallback animation) rather than
    /// being surfaced to the caller.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::Decode(_) | Self::Synthesis(_) | Self::Playback(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LipSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = LipSyncError::Decode("bad header".into());
        assert_eq!(err.to_string(), "[DECODE_ERROR] bad header");
        assert_eq!(err.code(), error_codes::DECODE_ERROR);
    }

    #[test]
    fn audio_path_failures_are_contained() {
        assert!(LipSyncError::SourceUnavailable("x".into()).is_contained());
        assert!(LipSyncError::Decode("x".into()).is_contained());
        assert!(LipSyncError::Synthesis("x".into()).is_contained());
        assert!(!LipSyncError::Transport("x".into()).is_contained());
        assert!(!LipSyncError::Config("x".into()).is_contained());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LipSyncError = io.into();
        assert_eq!(err.code(), error_codes::IO_ERROR);
    }
}
