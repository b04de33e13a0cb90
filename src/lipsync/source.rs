//! Source acquisition strategies.
//!
//! Every way of obtaining an analyzable signal is one [`SourceStrategy`]
//! variant with one provider. The controller tries offered providers in the
//! configured priority order, each under a timeout.

use crate::audio::stream::LiveAudio;
use crate::audio::{
    AnalyzableSignal, AudioEnvironment, BufferSource, ScheduledChunkSource, StreamTap,
};
use crate::error::{LipSyncError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// How often the scheduled-capture provider re-checks for audio.
const SCHEDULE_POLL: Duration = Duration::from_millis(10);

/// Ways to obtain an analyzable signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStrategy {
    /// A decoded payload the engine plays itself.
    Buffer,
    /// The audio tap an active transport exposes through its contract.
    TransportTap,
    /// A live stream published in the host [`AudioEnvironment`].
    Environment,
    /// The scheduled-chunk timeline fed by streamed PCM frames.
    ScheduledCapture,
}

impl std::fmt::Display for SourceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Buffer => "buffer",
            Self::TransportTap => "transport_tap",
            Self::Environment => "environment",
            Self::ScheduledCapture => "scheduled_capture",
        };
        f.write_str(name)
    }
}

/// One-shot producer of an analyzable signal for a single strategy.
#[async_trait]
pub trait SourceProvider: Send {
    /// The strategy this provider implements.
    fn strategy(&self) -> SourceStrategy;

    /// Acquire the signal. The controller bounds this with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::SourceUnavailable`] when the source cannot be
    /// observed (denied, unsupported, closed).
    async fn acquire(self: Box<Self>) -> Result<Box<dyn AnalyzableSignal>>;
}

/// Sort `providers` by `priority`; strategies missing from the list keep
/// their offered order after the listed ones.
pub fn order_by_priority(
    mut providers: Vec<Box<dyn SourceProvider>>,
    priority: &[SourceStrategy],
) -> Vec<Box<dyn SourceProvider>> {
    providers.sort_by_key(|p| {
        priority
            .iter()
            .position(|s| *s == p.strategy())
            .unwrap_or(priority.len())
    });
    providers
}

/// Plays a decoded buffer from the moment it is acquired.
#[derive(Debug)]
pub struct BufferProvider {
    source: BufferSource,
}

impl BufferProvider {
    /// Wrap a decoded buffer.
    pub fn new(source: BufferSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl SourceProvider for BufferProvider {
    fn strategy(&self) -> SourceStrategy {
        SourceStrategy::Buffer
    }

    async fn acquire(self: Box<Self>) -> Result<Box<dyn AnalyzableSignal>> {
        let mut source = self.source;
        source.start(Instant::now())?;
        Ok(Box::new(source))
    }
}

/// Taps the live audio a transport supplies through its `audio_tap`
/// contract. Acquisition completes when the first frame arrives.
pub struct TransportTapProvider {
    tap: LiveAudio,
    capacity: usize,
    stale_after: Duration,
}

impl TransportTapProvider {
    /// Wrap a transport's tap.
    pub fn new(tap: LiveAudio, capacity: usize, stale_after: Duration) -> Self {
        Self {
            tap,
            capacity,
            stale_after,
        }
    }
}

#[async_trait]
impl SourceProvider for TransportTapProvider {
    fn strategy(&self) -> SourceStrategy {
        SourceStrategy::TransportTap
    }

    async fn acquire(self: Box<Self>) -> Result<Box<dyn AnalyzableSignal>> {
        let mut rx = self.tap;
        let first = loop {
            match rx.recv().await {
                Ok(frame) => break frame,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(LipSyncError::SourceUnavailable(
                        "transport audio tap closed".into(),
                    ));
                }
            }
        };
        let mut tap = StreamTap::attach(rx, self.capacity, self.stale_after);
        tap.seed(&first, Instant::now());
        Ok(Box::new(tap))
    }
}

/// Discovers a live stream published in the host environment.
#[derive(Debug)]
pub struct EnvironmentProvider {
    environment: AudioEnvironment,
    capacity: usize,
    stale_after: Duration,
}

impl EnvironmentProvider {
    /// Search `environment` for a live stream.
    pub fn new(environment: AudioEnvironment, capacity: usize, stale_after: Duration) -> Self {
        Self {
            environment,
            capacity,
            stale_after,
        }
    }
}

#[async_trait]
impl SourceProvider for EnvironmentProvider {
    fn strategy(&self) -> SourceStrategy {
        SourceStrategy::Environment
    }

    async fn acquire(self: Box<Self>) -> Result<Box<dyn AnalyzableSignal>> {
        let (name, rx) = self.environment.wait_for_stream().await;
        debug!(stream = %name, "environment stream discovered");
        Ok(Box::new(StreamTap::attach(rx, self.capacity, self.stale_after)))
    }
}

/// Analyzes the scheduled-chunk timeline once audio is scheduled on it.
#[derive(Debug)]
pub struct ScheduledCaptureProvider {
    source: ScheduledChunkSource,
}

impl ScheduledCaptureProvider {
    /// Capture from `source`.
    pub fn new(source: ScheduledChunkSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl SourceProvider for ScheduledCaptureProvider {
    fn strategy(&self) -> SourceStrategy {
        SourceStrategy::ScheduledCapture
    }

    async fn acquire(self: Box<Self>) -> Result<Box<dyn AnalyzableSignal>> {
        while !self.source.is_playing(Instant::now()) {
            tokio::time::sleep(SCHEDULE_POLL).await;
        }
        Ok(Box::new(self.source.signal()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::audio::{AudioFrame, NullPlayback};
    use std::sync::Arc;

    struct Named(SourceStrategy);

    #[async_trait]
    impl SourceProvider for Named {
        fn strategy(&self) -> SourceStrategy {
            self.0
        }

        async fn acquire(self: Box<Self>) -> Result<Box<dyn AnalyzableSignal>> {
            Err(LipSyncError::SourceUnavailable("test".into()))
        }
    }

    #[test]
    fn providers_follow_priority() {
        let offered: Vec<Box<dyn SourceProvider>> = vec![
            Box::new(Named(SourceStrategy::ScheduledCapture)),
            Box::new(Named(SourceStrategy::Buffer)),
            Box::new(Named(SourceStrategy::TransportTap)),
        ];
        let ordered = order_by_priority(
            offered,
            &[SourceStrategy::TransportTap, SourceStrategy::ScheduledCapture],
        );
        let strategies: Vec<_> = ordered.iter().map(|p| p.strategy()).collect();
        assert_eq!(
            strategies,
            vec![
                SourceStrategy::TransportTap,
                SourceStrategy::ScheduledCapture,
                SourceStrategy::Buffer
            ]
        );
    }

    #[test]
    fn strategy_display_matches_serde() {
        assert_eq!(SourceStrategy::TransportTap.to_string(), "transport_tap");
        assert_eq!(
            serde_json::to_string(&SourceStrategy::ScheduledCapture).unwrap(),
            "\"scheduled_capture\""
        );
    }

    #[tokio::test]
    async fn closed_transport_tap_is_unavailable() {
        let (tx, rx) = broadcast::channel::<Arc<AudioFrame>>(4);
        drop(tx);
        let provider = Box::new(TransportTapProvider::new(rx, 256, Duration::from_millis(100)));
        assert!(matches!(
            provider.acquire().await,
            Err(LipSyncError::SourceUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_capture_waits_for_audio() {
        let sink = Arc::new(NullPlayback::new());
        let source = ScheduledChunkSource::new(sink, Duration::from_millis(0));
        let provider = Box::new(ScheduledCaptureProvider::new(source.clone()));
        let pending = tokio::spawn(provider.acquire());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());
        source
            .push(AudioFrame::new(vec![0.2; 1600], 16_000))
            .unwrap();
        assert!(pending.await.unwrap().is_ok());
    }
}
