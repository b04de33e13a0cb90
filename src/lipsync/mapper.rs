//! Loudness-to-mouth transfer function with graceful closing.

use crate::config::MapperConfig;

/// Maps scaled loudness to mouth openness and owns the decay accumulator.
#[derive(Debug, Clone)]
pub struct MouthMapper {
    config: MapperConfig,
    current: f32,
    decay: Option<Decay>,
}

#[derive(Debug, Clone, Copy)]
struct Decay {
    step: f32,
    remaining: u32,
}

impl MouthMapper {
    /// Create a mapper with a closed mouth.
    pub fn new(config: MapperConfig) -> Self {
        Self {
            config,
            current: 0.0,
            decay: None,
        }
    }

    /// The transfer function alone.
    ///
    /// Silence (at or below the threshold) closes the mouth instead of
    /// resting on the floor.
    pub fn transfer(&self, raw: f32) -> f32 {
        let c = &self.config;
        if !raw.is_finite() || raw <= c.silence_threshold || raw <= 0.0 {
            return 0.0;
        }
        // Must not panic when floor > ceiling or either bound is NaN.
        (raw * c.weight).max(c.floor).min(c.ceiling)
    }

    /// Map one loudness reading and remember it as the current value.
    pub fn apply(&mut self, raw: f32) -> f32 {
        self.decay = None;
        self.current = self.transfer(raw);
        self.current
    }

    /// Start closing linearly from the current value over `decay_frames`.
    pub fn begin_decay(&mut self) {
        let frames = self.config.decay_frames;
        if frames == 0 || self.current <= 0.0 {
            self.current = 0.0;
            self.decay = None;
            return;
        }
        self.decay = Some(Decay {
            step: self.current / frames as f32,
            remaining: frames,
        });
    }

    /// Advance the decay by one frame.
    ///
    /// Returns the new value, or `None` once the mouth is fully closed.
    pub fn decay_step(&mut self) -> Option<f32> {
        let decay = self.decay.as_mut()?;
        decay.remaining -= 1;
        if decay.remaining == 0 {
            self.decay = None;
            self.current = 0.0;
        } else {
            self.current = (self.current - decay.step).max(0.0);
        }
        Some(self.current)
    }

    /// Whether a decay is in progress.
    pub fn is_decaying(&self) -> bool {
        self.decay.is_some()
    }

    /// Force the mouth closed.
    pub fn reset(&mut self) {
        self.current = 0.0;
        self.decay = None;
    }

    /// Override the current value (used by the synthetic fallback so a
    /// later decay starts from what is on screen).
    pub fn set_current(&mut self, value: f32) {
        self.decay = None;
        self.current = value.clamp(0.0, 1.0);
    }

    /// Last written value.
    pub fn current(&self) -> f32 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(weight: f32, floor: f32, ceiling: f32) -> MouthMapper {
        MouthMapper::new(MapperConfig {
            weight,
            floor,
            ceiling,
            ..MapperConfig::default()
        })
    }

    #[test]
    fn zero_loudness_closes_the_mouth() {
        let m = mapper(1.0, 0.4, 1.0);
        assert_eq!(m.transfer(0.0), 0.0);
    }

    #[test]
    fn below_threshold_is_closed_not_floored() {
        let m = mapper(1.0, 0.4, 1.0);
        assert_eq!(m.transfer(0.019), 0.0);
        assert_eq!(m.transfer(0.02), 0.0);
    }

    #[test]
    fn audible_loudness_is_clamped_between_floor_and_ceiling() {
        let m = mapper(1.0, 0.4, 1.0);
        for raw in [0.021, 0.05, 0.3, 0.4, 0.7, 1.0, 3.0, 50.0] {
            let v = m.transfer(raw);
            assert!((0.4..=1.0).contains(&v), "raw {raw} mapped to {v}");
        }
        assert!((m.transfer(0.7) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn weight_scales_before_clamping() {
        let m = mapper(0.5, 0.2, 0.9);
        assert!((m.transfer(1.0) - 0.5).abs() < 1e-6);
        assert!((m.transfer(4.0) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn non_finite_loudness_is_closed() {
        let m = mapper(1.0, 0.4, 1.0);
        assert_eq!(m.transfer(f32::NAN), 0.0);
        assert_eq!(m.transfer(f32::INFINITY), 0.0);
    }

    #[test]
    fn inverted_bounds_do_not_panic() {
        let m = mapper(1.0, 0.9, 0.5);
        assert_eq!(m.transfer(0.5), 0.5);
        let m = mapper(1.0, f32::NAN, 1.0);
        assert!((m.transfer(0.7) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn decay_reaches_zero_in_configured_frames() {
        let mut m = MouthMapper::new(MapperConfig {
            decay_frames: 4,
            floor: 0.0,
            ..MapperConfig::default()
        });
        m.apply(0.8);
        m.begin_decay();
        let trace: Vec<f32> = std::iter::from_fn(|| m.decay_step()).collect();
        assert_eq!(trace.len(), 4);
        assert!(trace.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(*trace.last().unwrap_or(&1.0), 0.0);
        assert!(!m.is_decaying());
    }

    #[test]
    fn decay_from_closed_is_immediate() {
        let mut m = mapper(1.0, 0.3, 1.0);
        m.begin_decay();
        assert!(m.decay_step().is_none());
        assert_eq!(m.current(), 0.0);
    }
}
