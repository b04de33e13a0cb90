//! Per-frame loudness extraction.

use crate::audio::{AnalyzableSignal, SignalPoll};
use crate::config::AnalyzerConfig;
use tokio::time::Instant;

/// One analyzer sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Scaled RMS loudness of the current window.
    Level(f32),
    /// The signal played out.
    Exhausted,
    /// The signal vanished.
    Lost,
}

/// Pulls a fixed-width window from the bound signal and measures it.
#[derive(Debug, Clone)]
pub struct SignalAnalyzer {
    window: Vec<f32>,
    rms_scale: f32,
}

impl SignalAnalyzer {
    /// Create an analyzer with the configured window width.
    pub fn new(config: &AnalyzerConfig, rms_scale: f32) -> Self {
        Self {
            window: vec![0.0; config.window_size.max(1)],
            rms_scale,
        }
    }

    /// Sample `signal` at `now`.
    pub fn sample(&mut self, signal: &mut dyn AnalyzableSignal, now: Instant) -> Reading {
        match signal.poll_window(now, &mut self.window) {
            SignalPoll::Active => Reading::Level(compute_rms(&self.window) * self.rms_scale),
            SignalPoll::Exhausted => Reading::Exhausted,
            SignalPoll::Lost => Reading::Lost,
        }
    }

    /// The most recent window, for diagnostics.
    pub fn window(&self) -> &[f32] {
        &self.window
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(f32);

    impl AnalyzableSignal for Constant {
        fn poll_window(&mut self, _now: Instant, window: &mut [f32]) -> SignalPoll {
            window.fill(self.0);
            SignalPoll::Active
        }

        fn release(&mut self) {}
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(compute_rms(&[0.0; 64]), 0.0);
        assert_eq!(compute_rms(&[]), 0.0);
    }

    #[test]
    fn rms_of_square_wave_is_amplitude() {
        let wave: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }).collect();
        assert!((compute_rms(&wave) - 0.3).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn reading_is_scaled() {
        let mut analyzer = SignalAnalyzer::new(&AnalyzerConfig::default(), 4.0);
        let mut signal = Constant(0.1);
        match analyzer.sample(&mut signal, Instant::now()) {
            Reading::Level(v) => assert!((v - 0.4).abs() < 1e-5),
            other => panic!("unexpected reading {other:?}"),
        }
        assert_eq!(analyzer.window().len(), 256);
    }
}
