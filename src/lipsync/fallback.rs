//! Synthetic mouth animation for when no audio can be observed.
//!
//! This is an explicit degraded mode: it keeps the avatar from looking
//! frozen for a fixed time, then closes the mouth on its own.

use crate::config::FallbackConfig;
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::time::Instant;

/// Deterministic bounded oscillation started at a fixed instant.
#[derive(Debug, Clone)]
pub struct SyntheticFallback {
    config: FallbackConfig,
    started_at: Instant,
}

impl SyntheticFallback {
    /// Start the oscillation at `started_at`.
    pub fn start(config: FallbackConfig, started_at: Instant) -> Self {
        Self { config, started_at }
    }

    /// Configured run time.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.config.duration_ms)
    }

    /// Mouth value at `now`, or `None` once the run time has elapsed.
    pub fn value_at(&self, now: Instant) -> Option<f32> {
        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed >= self.duration() {
            return None;
        }
        Some(self.shape(elapsed.as_secs_f32()))
    }

    fn shape(&self, t: f32) -> f32 {
        let c = &self.config;
        let syllable = (TAU * c.primary_hz * t).sin().abs();
        let phrase = 0.7 + 0.3 * (TAU * c.secondary_hz * t).sin();
        (c.base + c.amplitude * syllable * phrase).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn oscillation_is_bounded_and_varies() {
        let start = Instant::now();
        let fb = SyntheticFallback::start(FallbackConfig::default(), start);
        let values: Vec<f32> = (0..180)
            .filter_map(|i| fb.value_at(start + Duration::from_millis(i * 16)))
            .collect();
        assert_eq!(values.len(), 180);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        let min = values.iter().copied().fold(f32::MAX, f32::min);
        let max = values.iter().copied().fold(f32::MIN, f32::max);
        assert!(max - min > 0.3, "range {min}..{max}");
    }

    #[tokio::test(start_paused = true)]
    async fn ends_after_duration() {
        let start = Instant::now();
        let fb = SyntheticFallback::start(
            FallbackConfig {
                duration_ms: 500,
                ..FallbackConfig::default()
            },
            start,
        );
        assert!(fb.value_at(start + Duration::from_millis(499)).is_some());
        assert!(fb.value_at(start + Duration::from_millis(500)).is_none());
    }

    #[test]
    fn large_amplitude_is_clamped() {
        let start = Instant::now();
        let fb = SyntheticFallback::start(
            FallbackConfig {
                base: 0.5,
                amplitude: 5.0,
                ..FallbackConfig::default()
            },
            start,
        );
        for ms in 0..1000 {
            let v = fb.value_at(start + Duration::from_millis(ms)).unwrap_or(0.0);
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
