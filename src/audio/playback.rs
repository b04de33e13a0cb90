//! Playback sinks.
//!
//! A sink accepts whole frames with a start instant and can cancel them
//! before or during playback. Analysis never reads back from the sink; the
//! adapters keep their own copy of what they scheduled.

use crate::audio::AudioFrame;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Identifier of one scheduled playback on a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

/// Audio output that plays frames at scheduled instants.
pub trait PlaybackSink: Send + Sync {
    /// Schedule `frame` to start playing at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Playback`](crate::error::LipSyncError::Playback)
    /// if the output cannot accept audio.
    fn start(&self, frame: Arc<AudioFrame>, at: Instant) -> Result<PlaybackId>;

    /// Stop a scheduled or playing frame. Unknown ids are ignored.
    fn stop(&self, id: PlaybackId);
}

/// One entry in the [`NullPlayback`] log.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRecord {
    /// Playback identifier.
    pub id: PlaybackId,
    /// Scheduled start.
    pub start_at: Instant,
    /// Frame duration.
    pub duration: Duration,
    /// When the playback was stopped, if it was.
    pub stopped_at: Option<Instant>,
}

impl PlaybackRecord {
    /// Whether this playback produces sound at `now`.
    pub fn audible_at(&self, now: Instant) -> bool {
        let end = self.start_at + self.duration;
        let cut = self.stopped_at.map_or(end, |s| s.min(end));
        now >= self.start_at && now < cut
    }
}

/// Clock-only sink: keeps a log of what would have played.
///
/// Used for headless hosts and tests. Pair it with a renderer to drive the
/// avatar without a speaker.
#[derive(Debug, Default)]
pub struct NullPlayback {
    next_id: AtomicU64,
    log: Mutex<Vec<PlaybackRecord>>,
}

impl NullPlayback {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every playback scheduled so far.
    pub fn records(&self) -> Vec<PlaybackRecord> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Playbacks producing sound at `now`.
    pub fn audible_at(&self, now: Instant) -> Vec<PlaybackId> {
        self.records()
            .into_iter()
            .filter(|r| r.audible_at(now))
            .map(|r| r.id)
            .collect()
    }
}

impl PlaybackSink for NullPlayback {
    fn start(&self, frame: Arc<AudioFrame>, at: Instant) -> Result<PlaybackId> {
        let id = PlaybackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut log) = self.log.lock() {
            log.push(PlaybackRecord {
                id,
                start_at: at,
                duration: frame.duration(),
                stopped_at: None,
            });
        }
        Ok(id)
    }

    fn stop(&self, id: PlaybackId) {
        let now = Instant::now();
        if let Ok(mut log) = self.log.lock()
            && let Some(rec) = log.iter_mut().find(|r| r.id == id)
            && rec.stopped_at.is_none()
        {
            rec.stopped_at = Some(now);
            debug!(id = id.0, "playback stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stopped_playback_is_not_audible() {
        let sink = NullPlayback::new();
        let frame = Arc::new(AudioFrame::new(vec![0.1; 1600], 16_000));
        let start = Instant::now();
        let id = sink.start(frame, start).unwrap();

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(sink.audible_at(Instant::now()), vec![id]);

        sink.stop(id);
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(sink.audible_at(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn future_playback_not_audible_before_start() {
        let sink = NullPlayback::new();
        let frame = Arc::new(AudioFrame::new(vec![0.1; 160], 16_000));
        let at = Instant::now() + Duration::from_millis(50);
        sink.start(frame, at).unwrap();
        assert!(sink.audible_at(Instant::now()).is_empty());
        assert_eq!(sink.audible_at(at).len(), 1);
        assert!(sink.audible_at(at + Duration::from_millis(10)).is_empty());
    }
}
