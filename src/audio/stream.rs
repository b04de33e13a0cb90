//! Stream adapter: analysis tap on a live audio stream.
//!
//! The tap only observes. Whoever owns the stream keeps playing it, so the
//! tap never schedules audio and can be dropped without affecting output.

use crate::audio::{AnalyzableSignal, AudioFrame, SignalPoll};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A live audio stream: frames broadcast as they are played.
pub type LiveAudio = broadcast::Receiver<Arc<AudioFrame>>;

/// Ring-buffered analysis tap on a [`LiveAudio`] stream.
pub struct StreamTap {
    rx: Option<LiveAudio>,
    ring: VecDeque<f32>,
    capacity: usize,
    last_frame_at: Option<Instant>,
    stale_after: Duration,
    ending: bool,
}

impl StreamTap {
    /// Attach to a live stream, keeping `capacity` samples of history.
    pub fn attach(rx: LiveAudio, capacity: usize, stale_after: Duration) -> Self {
        Self {
            rx: Some(rx),
            ring: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            last_frame_at: None,
            stale_after,
            ending: false,
        }
    }

    /// Seed the ring with a frame already pulled off the stream.
    pub fn seed(&mut self, frame: &AudioFrame, at: Instant) {
        self.push_samples(&frame.samples);
        self.last_frame_at = Some(at);
    }

    fn push_samples(&mut self, samples: &[f32]) {
        let overflow = (self.ring.len() + samples.len()).saturating_sub(self.capacity);
        let drop_from_ring = overflow.min(self.ring.len());
        self.ring.drain(..drop_from_ring);
        let skip = samples.len().saturating_sub(self.capacity);
        self.ring.extend(&samples[skip..]);
    }

    /// Pull everything queued on the stream. Returns `false` once the
    /// stream has closed.
    fn drain(&mut self, now: Instant) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        let mut fresh: Vec<Arc<AudioFrame>> = Vec::new();
        let open = loop {
            match rx.try_recv() {
                Ok(frame) => fresh.push(frame),
                Err(broadcast::error::TryRecvError::Empty) => break true,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "stream tap lagged, dropping old frames");
                }
                Err(broadcast::error::TryRecvError::Closed) => break false,
            }
        };
        if !fresh.is_empty() {
            for frame in &fresh {
                self.push_samples(&frame.samples);
            }
            self.last_frame_at = Some(now);
        }
        open
    }
}

impl AnalyzableSignal for StreamTap {
    fn poll_window(&mut self, now: Instant, window: &mut [f32]) -> SignalPoll {
        if !self.drain(now) {
            debug!("live stream closed under tap");
            return SignalPoll::Lost;
        }
        let fresh = self
            .last_frame_at
            .is_some_and(|t| now.saturating_duration_since(t) <= self.stale_after);
        window.fill(0.0);
        if self.ending && !fresh {
            return SignalPoll::Exhausted;
        }
        if fresh {
            let take = self.ring.len().min(window.len());
            let dst = window.len() - take;
            for (slot, s) in window[dst..]
                .iter_mut()
                .zip(self.ring.iter().skip(self.ring.len() - take))
            {
                *slot = *s;
            }
        }
        SignalPoll::Active
    }

    fn end_of_input(&mut self) {
        self.ending = true;
    }

    fn release(&mut self) {
        self.rx = None;
        self.ring.clear();
    }
}

#[derive(Default)]
struct EnvironmentInner {
    streams: Mutex<Vec<(String, broadcast::Sender<Arc<AudioFrame>>)>>,
    changed: Notify,
}

/// Registry of live audio streams present in the host environment.
///
/// Hosts publish streams they are playing (a media element, a remote
/// call track); the controller discovers one through the `Environment`
/// strategy instead of reaching into transport internals.
#[derive(Clone, Default)]
pub struct AudioEnvironment {
    inner: Arc<EnvironmentInner>,
}

impl std::fmt::Debug for AudioEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .inner
            .streams
            .lock()
            .map(|s| s.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default();
        f.debug_struct("AudioEnvironment")
            .field("streams", &names)
            .finish()
    }
}

impl AudioEnvironment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a live stream under `name`, replacing any previous one.
    pub fn publish(&self, name: impl Into<String>, sender: broadcast::Sender<Arc<AudioFrame>>) {
        let name = name.into();
        if let Ok(mut streams) = self.inner.streams.lock() {
            streams.retain(|(n, _)| *n != name);
            debug!(stream = %name, "live stream published");
            streams.push((name, sender));
        }
        self.inner.changed.notify_waiters();
    }

    /// Remove a published stream.
    pub fn withdraw(&self, name: &str) {
        if let Ok(mut streams) = self.inner.streams.lock() {
            streams.retain(|(n, _)| n != name);
        }
    }

    /// Subscribe to the earliest published stream, if any.
    pub fn subscribe_first(&self) -> Option<(String, LiveAudio)> {
        let streams = self.inner.streams.lock().ok()?;
        streams
            .first()
            .map(|(name, tx)| (name.clone(), tx.subscribe()))
    }

    /// Wait until a stream is published, then subscribe to it.
    ///
    /// Callers bound this with a timeout.
    pub async fn wait_for_stream(&self) -> (String, LiveAudio) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(found) = self.subscribe_first() {
                return found;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn frame(amp: f32, len: usize) -> Arc<AudioFrame> {
        Arc::new(AudioFrame::new(vec![amp; len], 16_000))
    }

    #[tokio::test(start_paused = true)]
    async fn tap_reads_latest_samples() {
        let (tx, rx) = broadcast::channel(16);
        let mut tap = StreamTap::attach(rx, 8, Duration::from_millis(250));
        tx.send(frame(0.1, 4)).unwrap();
        tx.send(frame(0.9, 4)).unwrap();

        let mut window = [0.0f32; 4];
        assert_eq!(tap.poll_window(Instant::now(), &mut window), SignalPoll::Active);
        assert_eq!(window, [0.9; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_stream_reads_as_silence() {
        let (tx, rx) = broadcast::channel(16);
        let mut tap = StreamTap::attach(rx, 8, Duration::from_millis(100));
        tx.send(frame(0.5, 8)).unwrap();
        let mut window = [0.0f32; 8];
        tap.poll_window(Instant::now(), &mut window);
        assert!(window.iter().all(|s| *s > 0.0));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(tap.poll_window(Instant::now(), &mut window), SignalPoll::Active);
        assert!(window.iter().all(|s| *s == 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_exhausts_once_stale() {
        let (tx, rx) = broadcast::channel(16);
        let mut tap = StreamTap::attach(rx, 8, Duration::from_millis(100));
        tx.send(frame(0.5, 8)).unwrap();
        let mut window = [0.0f32; 8];
        tap.end_of_input();
        // The tail still playing keeps the signal active.
        assert_eq!(tap.poll_window(Instant::now(), &mut window), SignalPoll::Active);
        assert!(window.iter().all(|s| *s > 0.0));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(tap.poll_window(Instant::now(), &mut window), SignalPoll::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_lost() {
        let (tx, rx) = broadcast::channel::<Arc<AudioFrame>>(4);
        let mut tap = StreamTap::attach(rx, 8, Duration::from_millis(100));
        drop(tx);
        let mut window = [0.0f32; 8];
        assert_eq!(tap.poll_window(Instant::now(), &mut window), SignalPoll::Lost);
    }

    #[test]
    fn ring_keeps_only_capacity() {
        let (_tx, rx) = broadcast::channel::<Arc<AudioFrame>>(4);
        let mut tap = StreamTap::attach(rx, 4, Duration::from_millis(100));
        tap.push_samples(&[1.0, 2.0, 3.0]);
        tap.push_samples(&[4.0, 5.0, 6.0]);
        assert_eq!(tap.ring.iter().copied().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0, 6.0]);
        tap.push_samples(&[7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(tap.ring.iter().copied().collect::<Vec<_>>(), vec![8.0, 9.0, 10.0, 11.0]);
    }

    #[tokio::test]
    async fn environment_wait_resolves_on_publish() {
        let env = AudioEnvironment::new();
        assert!(env.subscribe_first().is_none());

        let waiter = {
            let env = env.clone();
            tokio::spawn(async move { env.wait_for_stream().await.0 })
        };
        tokio::task::yield_now().await;
        let (tx, _rx) = broadcast::channel(4);
        env.publish("remote-track", tx);
        assert_eq!(waiter.await.unwrap(), "remote-track");

        env.withdraw("remote-track");
        assert!(env.subscribe_first().is_none());
    }
}
