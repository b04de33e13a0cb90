//! Scheduled-chunk adapter: gapless playback of PCM frames arriving
//! asynchronously, with the cumulative timeline exposed for analysis.

use crate::audio::{AnalyzableSignal, AudioFrame, PlaybackId, PlaybackSink, SignalPoll};
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Scheduled frames are kept this long after they finish so the analysis
/// window can reach back across a chunk boundary.
const HISTORY_RETENTION: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Scheduled {
    frame: Arc<AudioFrame>,
    start_at: Instant,
    end_at: Instant,
    playback: PlaybackId,
}

#[derive(Debug, Default)]
struct ScheduleState {
    entries: VecDeque<Scheduled>,
    next_start: Option<Instant>,
    turn_finished: bool,
}

impl ScheduleState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if front.end_at + HISTORY_RETENTION < now {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn drained(&self, now: Instant) -> bool {
        self.next_start.is_none_or(|end| now >= end)
    }
}

/// Schedules frames back-to-back on a sink.
///
/// Cloning yields another handle to the same timeline: the transport side
/// pushes frames while the controller analyzes through [`Self::signal`].
#[derive(Clone)]
pub struct ScheduledChunkSource {
    state: Arc<Mutex<ScheduleState>>,
    sink: Arc<dyn PlaybackSink>,
    min_lead: Duration,
}

impl std::fmt::Debug for ScheduledChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledChunkSource")
            .field("min_lead", &self.min_lead)
            .finish_non_exhaustive()
    }
}

impl ScheduledChunkSource {
    /// Create an empty timeline on `sink`.
    ///
    /// Each frame starts no sooner than `min_lead` from the moment it is
    /// pushed, which absorbs scheduling jitter without underruns.
    pub fn new(sink: Arc<dyn PlaybackSink>, min_lead: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScheduleState {
                turn_finished: true,
                ..ScheduleState::default()
            })),
            sink,
            min_lead,
        }
    }

    /// Schedule `frame` right after everything already scheduled.
    ///
    /// Returns the instant the frame will start. Pushing reopens a finished
    /// turn.
    ///
    /// # Errors
    ///
    /// Returns the sink's playback error; the timeline is left unchanged.
    pub fn push(&self, frame: AudioFrame) -> Result<Instant> {
        let now = Instant::now();
        let frame = Arc::new(frame);
        let mut state = self
            .state
            .lock()
            .map_err(|_| crate::error::LipSyncError::Playback("schedule lock poisoned".into()))?;
        state.prune(now);

        let earliest = now + self.min_lead;
        let start_at = state.next_start.map_or(earliest, |next| next.max(earliest));
        let end_at = start_at + frame.duration();
        let playback = self.sink.start(Arc::clone(&frame), start_at)?;

        state.entries.push_back(Scheduled {
            frame,
            start_at,
            end_at,
            playback,
        });
        state.next_start = Some(end_at);
        state.turn_finished = false;
        Ok(start_at)
    }

    /// Mark the current turn complete: once the timeline drains, the signal
    /// reports [`SignalPoll::Exhausted`].
    pub fn finish_turn(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.turn_finished = true;
        }
    }

    /// Cancel every frame that has not finished playing.
    ///
    /// Returns how many scheduled frames were cut.
    pub fn discard(&self) -> usize {
        let now = Instant::now();
        let Ok(mut state) = self.state.lock() else {
            warn!("schedule lock poisoned, nothing discarded");
            return 0;
        };
        let mut cut = 0;
        for entry in state.entries.iter().filter(|e| e.end_at > now) {
            self.sink.stop(entry.playback);
            cut += 1;
        }
        state.entries.clear();
        state.next_start = None;
        state.turn_finished = true;
        if cut > 0 {
            debug!(frames = cut, "discarded unplayed scheduled audio");
        }
        cut
    }

    /// Whether anything is still scheduled to play at `now`.
    pub fn is_playing(&self, now: Instant) -> bool {
        self.state
            .lock()
            .map(|s| !s.drained(now))
            .unwrap_or(false)
    }

    /// When the last scheduled frame finishes, if anything is scheduled.
    pub fn scheduled_until(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|s| s.next_start)
    }

    /// An analyzable view of this timeline.
    pub fn signal(&self) -> ScheduledSignal {
        ScheduledSignal {
            source: self.clone(),
            released: false,
        }
    }

    fn fill(&self, now: Instant, window: &mut [f32]) -> SignalPoll {
        window.fill(0.0);
        let Ok(state) = self.state.lock() else {
            return SignalPoll::Lost;
        };
        if state.turn_finished && state.drained(now) {
            return SignalPoll::Exhausted;
        }
        let Some(pos) = state
            .entries
            .iter()
            .position(|e| e.start_at <= now && now < e.end_at)
        else {
            // Between frames or before the first one starts.
            return SignalPoll::Active;
        };

        let current = &state.entries[pos];
        let idx = current.frame.sample_index_at(now - current.start_at);
        super::fill_window_ending_at(&current.frame.samples, idx, window);

        // Reach into the previous frame when it ended exactly where this one starts.
        let covered = idx.min(window.len());
        let missing = window.len() - covered;
        if missing > 0
            && pos > 0
            && let Some(prev) = state.entries.get(pos - 1)
            && prev.end_at == current.start_at
        {
            let prev_samples = &prev.frame.samples;
            let take = missing.min(prev_samples.len());
            let dst_end = missing;
            window[dst_end - take..dst_end]
                .copy_from_slice(&prev_samples[prev_samples.len() - take..]);
        }
        SignalPoll::Active
    }
}

/// [`AnalyzableSignal`] over a [`ScheduledChunkSource`] timeline.
///
/// Releasing it discards any audio that has not played yet.
#[derive(Debug)]
pub struct ScheduledSignal {
    source: ScheduledChunkSource,
    released: bool,
}

impl AnalyzableSignal for ScheduledSignal {
    fn poll_window(&mut self, now: Instant, window: &mut [f32]) -> SignalPoll {
        if self.released {
            return SignalPoll::Lost;
        }
        self.source.fill(now, window)
    }

    fn end_of_input(&mut self) {
        self.source.finish_turn();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.source.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::audio::NullPlayback;

    fn chunk(amp: f32, ms: u64) -> AudioFrame {
        AudioFrame::new(vec![amp; (16 * ms) as usize], 16_000)
    }

    #[tokio::test(start_paused = true)]
    async fn frames_play_back_to_back_after_lead() {
        let sink = Arc::new(NullPlayback::new());
        let src = ScheduledChunkSource::new(sink.clone(), Duration::from_millis(50));
        let t0 = Instant::now();

        let a = src.push(chunk(0.5, 100)).unwrap();
        let b = src.push(chunk(0.5, 100)).unwrap();
        assert_eq!(a, t0 + Duration::from_millis(50));
        assert_eq!(b, a + Duration::from_millis(100));
        assert_eq!(src.scheduled_until(), Some(b + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn underrun_restarts_with_lead() {
        let sink = Arc::new(NullPlayback::new());
        let src = ScheduledChunkSource::new(sink, Duration::from_millis(50));
        src.push(chunk(0.5, 20)).unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let now = Instant::now();
        let start = src.push(chunk(0.5, 20)).unwrap();
        assert_eq!(start, now + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_tracks_timeline_and_exhausts_after_turn() {
        let sink = Arc::new(NullPlayback::new());
        let src = ScheduledChunkSource::new(sink, Duration::from_millis(50));
        let mut signal = src.signal();
        src.push(chunk(0.6, 100)).unwrap();
        src.finish_turn();

        let mut window = [0.0f32; 64];
        // Inside the lead time: nothing audible yet.
        assert_eq!(signal.poll_window(Instant::now(), &mut window), SignalPoll::Active);
        assert!(window.iter().all(|s| *s == 0.0));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(signal.poll_window(Instant::now(), &mut window), SignalPoll::Active);
        assert!(window.iter().all(|s| (*s - 0.6).abs() < 1e-6));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(
            signal.poll_window(Instant::now(), &mut window),
            SignalPoll::Exhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn window_spans_contiguous_frames() {
        let sink = Arc::new(NullPlayback::new());
        let src = ScheduledChunkSource::new(sink, Duration::from_millis(0));
        src.push(chunk(0.2, 100)).unwrap();
        src.push(chunk(0.8, 100)).unwrap();

        // 1 ms into the second frame: 16 new samples, the rest from the first.
        tokio::time::advance(Duration::from_millis(101)).await;
        let mut window = [0.0f32; 64];
        src.signal().poll_window(Instant::now(), &mut window);
        assert!((window[0] - 0.2).abs() < 1e-6);
        assert!((window[63] - 0.8).abs() < 1e-6);
        assert!(window.iter().all(|s| *s > 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn discard_cuts_unplayed_audio() {
        let sink = Arc::new(NullPlayback::new());
        let src = ScheduledChunkSource::new(sink.clone(), Duration::from_millis(50));
        for _ in 0..4 {
            src.push(chunk(0.5, 100)).unwrap();
        }
        tokio::time::advance(Duration::from_millis(120)).await;
        assert_eq!(src.discard(), 4);
        assert!(!src.is_playing(Instant::now()));

        for offset in [0u64, 100, 200, 300] {
            let later = Instant::now() + Duration::from_millis(offset);
            assert!(sink.audible_at(later).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn released_signal_discards_and_reports_lost() {
        let sink = Arc::new(NullPlayback::new());
        let src = ScheduledChunkSource::new(sink.clone(), Duration::from_millis(50));
        src.push(chunk(0.5, 100)).unwrap();
        let mut signal = src.signal();
        signal.release();
        assert!(sink.records()[0].stopped_at.is_some());
        let mut window = [0.0f32; 8];
        assert_eq!(signal.poll_window(Instant::now(), &mut window), SignalPoll::Lost);
    }
}
