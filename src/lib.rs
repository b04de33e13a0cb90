//! Audio-driven lip-sync for talking avatars.
//!
//! The engine derives a mouth-openness signal from whatever audio it can
//! observe and drives a character renderer with it in real time, while
//! holding a conversation over text, streaming-text, or realtime audio:
//!
//! Transport → Speech queue → Lip-sync controller → Analyzer → Mapper → Renderer
//!
//! # Architecture
//!
//! - **Audio sources** (`audio`): decoded buffers, live stream taps, and
//!   scheduled PCM chunks behind one [`audio::AnalyzableSignal`] trait
//! - **Lip-sync** (`lipsync`): loudness analysis, the transfer function,
//!   synthetic fallback, and the per-utterance session controller
//! - **Speech** (`speech`): sentence splitting, concurrent synthesis, and
//!   strictly ordered playback
//! - **Transports** (`transport`): OpenAI-compatible chat and a realtime
//!   WebSocket session
//! - **Conversation** (`conversation`): per-turn flows tying it together

pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod lipsync;
pub mod logging;
pub mod renderer;
pub mod runtime;
pub mod speech;
pub mod transport;

pub use config::LipSyncConfig;
pub use conversation::Conversation;
pub use error::{LipSyncError, Result};
pub use lipsync::{LipSyncController, SessionState, StopReason, UtteranceOutcome};
pub use renderer::AvatarRenderer;
pub use runtime::RuntimeEvent;
