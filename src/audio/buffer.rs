//! Buffer adapter: one decoded payload shared by playback and analysis.

use crate::audio::decode::decode_to_frame;
use crate::audio::{AnalyzableSignal, AudioFrame, PlaybackId, PlaybackSink, SignalPoll};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A decoded buffer being played on a sink.
///
/// The analysis window follows the playback position, so the mouth tracks
/// exactly what the listener hears.
pub struct BufferSource {
    frame: Arc<AudioFrame>,
    sink: Arc<dyn PlaybackSink>,
    started_at: Option<Instant>,
    playback: Option<PlaybackId>,
    released: bool,
}

impl std::fmt::Debug for BufferSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSource")
            .field("samples", &self.frame.samples.len())
            .field("sample_rate", &self.frame.sample_rate)
            .field("started_at", &self.started_at)
            .field("released", &self.released)
            .finish()
    }
}

impl BufferSource {
    /// Decode `payload` and prepare it for playback on `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Decode`](crate::error::LipSyncError::Decode)
    /// if the payload is malformed. Nothing is scheduled in that case.
    pub fn decode(
        payload: &[u8],
        format_hint: Option<&str>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Result<Self> {
        let frame = decode_to_frame(payload, format_hint)?;
        Ok(Self::from_frame(Arc::new(frame), sink))
    }

    /// Wrap an already decoded frame.
    pub fn from_frame(frame: Arc<AudioFrame>, sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            frame,
            sink,
            started_at: None,
            playback: None,
            released: false,
        }
    }

    /// Schedule playback at `at`. Calling again has no effect.
    ///
    /// # Errors
    ///
    /// Returns the sink's playback error.
    pub fn start(&mut self, at: Instant) -> Result<()> {
        if self.started_at.is_some() {
            return Ok(());
        }
        let id = self.sink.start(Arc::clone(&self.frame), at)?;
        self.playback = Some(id);
        self.started_at = Some(at);
        debug!(
            samples = self.frame.samples.len(),
            duration_ms = self.duration().as_millis() as u64,
            "buffer playback scheduled"
        );
        Ok(())
    }

    /// Total playback duration.
    pub fn duration(&self) -> Duration {
        self.frame.duration()
    }
}

impl AnalyzableSignal for BufferSource {
    fn poll_window(&mut self, now: Instant, window: &mut [f32]) -> SignalPoll {
        if self.released {
            return SignalPoll::Lost;
        }
        let Some(started_at) = self.started_at else {
            window.fill(0.0);
            return SignalPoll::Active;
        };
        if now < started_at {
            window.fill(0.0);
            return SignalPoll::Active;
        }
        let position = self.frame.sample_index_at(now - started_at);
        if position >= self.frame.samples.len() {
            return SignalPoll::Exhausted;
        }
        super::fill_window_ending_at(&self.frame.samples, position, window);
        SignalPoll::Active
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(id) = self.playback.take() {
            self.sink.stop(id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::audio::NullPlayback;
    use crate::error::LipSyncError;

    fn tone(len: usize, amp: f32) -> Arc<AudioFrame> {
        Arc::new(AudioFrame::new(
            (0..len).map(|i| if i % 2 == 0 { amp } else { -amp }).collect(),
            16_000,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn window_follows_playback_position() {
        let sink = Arc::new(NullPlayback::new());
        let mut src = BufferSource::from_frame(tone(16_000, 0.5), sink.clone());
        src.start(Instant::now()).unwrap();

        let mut window = [0.0f32; 256];
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(src.poll_window(Instant::now(), &mut window), SignalPoll::Active);
        assert!(window.iter().all(|s| s.abs() > 0.4));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            src.poll_window(Instant::now(), &mut window),
            SignalPoll::Exhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn early_window_is_zero_padded() {
        let sink = Arc::new(NullPlayback::new());
        let mut src = BufferSource::from_frame(tone(16_000, 0.5), sink);
        src.start(Instant::now()).unwrap();

        // 1 ms in = 16 samples of history.
        tokio::time::advance(Duration::from_millis(1)).await;
        let mut window = [1.0f32; 256];
        src.poll_window(Instant::now(), &mut window);
        let zeros = window.iter().filter(|s| **s == 0.0).count();
        assert!((239..=241).contains(&zeros), "zeros = {zeros}");
    }

    #[tokio::test(start_paused = true)]
    async fn release_stops_playback_and_reports_lost() {
        let sink = Arc::new(NullPlayback::new());
        let mut src = BufferSource::from_frame(tone(16_000, 0.5), sink.clone());
        src.start(Instant::now()).unwrap();
        src.release();
        src.release();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].stopped_at.is_some());
        let mut window = [0.0f32; 8];
        assert_eq!(src.poll_window(Instant::now(), &mut window), SignalPoll::Lost);
    }

    #[test]
    fn malformed_payload_schedules_nothing() {
        let sink = Arc::new(NullPlayback::new());
        let err = BufferSource::decode(b"nope", None, sink.clone()).unwrap_err();
        assert!(matches!(err, LipSyncError::Decode(_)));
        assert!(sink.records().is_empty());
    }
}
