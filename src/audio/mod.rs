//! Audio source adapters: decoded buffers, live stream taps, and scheduled
//! PCM chunks, all exposed as an [`AnalyzableSignal`].

pub mod buffer;
pub mod decode;
pub mod playback;
pub mod scheduled;
#[cfg(feature = "speaker")]
pub mod speaker;
pub mod stream;

pub use buffer::BufferSource;
pub use playback::{NullPlayback, PlaybackId, PlaybackSink};
pub use scheduled::{ScheduledChunkSource, ScheduledSignal};
pub use stream::{AudioEnvironment, StreamTap};

use std::time::Duration;
use tokio::time::Instant;

/// A block of mono linear PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// f32 samples in \[-1, 1\].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioFrame {
    /// Create a frame from samples at the given rate.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode little-endian signed 16-bit PCM (the realtime wire format).
    ///
    /// A trailing odd byte is ignored.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Encode as little-endian signed 16-bit PCM.
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &s in &self.samples {
            let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Playback duration of this frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Whether the frame holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Index of the sample playing `elapsed` after the frame started.
    pub(crate) fn sample_index_at(&self, elapsed: Duration) -> usize {
        (elapsed.as_secs_f64() * f64::from(self.sample_rate)) as usize
    }
}

/// Result of polling an [`AnalyzableSignal`] for one animation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPoll {
    /// The window was filled with the current signal (possibly silence).
    Active,
    /// The signal played out normally; the mouth should decay closed.
    Exhausted,
    /// The signal disappeared abruptly; the mouth should close immediately.
    Lost,
}

/// The live, time-varying object the analyzer samples each frame.
///
/// Exactly one signal is bound per speaking session, owned by the
/// controller, and released when the session ends or is superseded.
pub trait AnalyzableSignal: Send {
    /// Fill `window` with the most recent samples at `now`.
    ///
    /// Positions without audio are written as zeros.
    fn poll_window(&mut self, now: Instant, window: &mut [f32]) -> SignalPoll;

    /// No more audio will arrive for this utterance. The signal reports
    /// [`SignalPoll::Exhausted`] once what is already buffered has played.
    fn end_of_input(&mut self) {}

    /// Stop any playback this signal owns and disconnect analysis taps.
    ///
    /// Must be idempotent.
    fn release(&mut self);
}

/// Copy up to `window.len()` samples ending just before `end` into the tail
/// of `window`, zero-filling whatever the source cannot cover.
pub(crate) fn fill_window_ending_at(samples: &[f32], end: usize, window: &mut [f32]) {
    window.fill(0.0);
    let end = end.min(samples.len());
    let take = end.min(window.len());
    let dst_start = window.len() - take;
    window[dst_start..].copy_from_slice(&samples[end - take..end]);
}
