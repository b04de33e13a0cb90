//! Audio-to-mouth synchronization.
//!
//! [`analyzer`] measures the bound signal, [`mapper`] and [`fallback`] turn
//! loudness (or its absence) into mouth openness, and [`controller`] owns the
//! per-utterance session that ties them to a renderer.

pub mod analyzer;
pub mod controller;
pub mod driver;
pub mod fallback;
pub mod mapper;
pub mod source;

pub use controller::{
    LipSyncController, PendingUtterance, SessionState, StopReason, UtteranceHandle,
    UtteranceOutcome,
};
pub use driver::FrameDriver;
pub use source::{
    BufferProvider, EnvironmentProvider, ScheduledCaptureProvider, SourceProvider,
    SourceStrategy, TransportTapProvider,
};
