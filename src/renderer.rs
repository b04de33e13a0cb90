//! Character renderer boundary.
//!
//! The engine never draws anything; it drives a renderer through this trait.

use std::collections::VecDeque;
use std::sync::Mutex;

/// The animated character the engine drives.
///
/// Calls arrive from the frame loop and must not block.
pub trait AvatarRenderer: Send + Sync {
    /// Write the mouth-openness parameter, in \[0, 1\].
    fn set_mouth_openness(&self, value: f32);

    /// Forward a hit-area interaction to the character.
    fn on_hit(&self, area: &str);

    /// Start a motion from a named group.
    fn play_motion(&self, group: &str, index: u32, priority: u32);

    /// Switch facial expression.
    fn set_expression(&self, name: &str);
}

/// A renderer call, as captured by [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub enum RendererCall {
    Mouth(f32),
    Hit(String),
    Motion { group: String, index: u32, priority: u32 },
    Expression(String),
}

/// Headless renderer that records calls.
///
/// [`new`](Self::new) keeps every call and suits tests. Long-running
/// headless hosts use [`bounded`](Self::bounded), which keeps only the most
/// recent calls.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    calls: Mutex<VecDeque<RendererCall>>,
    limit: Option<usize>,
}

impl RecordingRenderer {
    /// Create an empty recorder with no limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder that keeps at most `limit` calls.
    pub fn bounded(limit: usize) -> Self {
        Self {
            calls: Mutex::new(VecDeque::with_capacity(limit)),
            limit: Some(limit),
        }
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<RendererCall> {
        self.calls
            .lock()
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The mouth values written so far, in order.
    pub fn mouth_values(&self) -> Vec<f32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RendererCall::Mouth(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// The last mouth value written, or 0 if none.
    pub fn last_mouth(&self) -> f32 {
        self.mouth_values().last().copied().unwrap_or(0.0)
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: RendererCall) {
        if let Ok(mut calls) = self.calls.lock() {
            if let Some(limit) = self.limit {
                if limit == 0 {
                    return;
                }
                while calls.len() >= limit {
                    calls.pop_front();
                }
            }
            calls.push_back(call);
        }
    }
}

impl AvatarRenderer for RecordingRenderer {
    fn set_mouth_openness(&self, value: f32) {
        self.record(RendererCall::Mouth(value));
    }

    fn on_hit(&self, area: &str) {
        self.record(RendererCall::Hit(area.to_owned()));
    }

    fn play_motion(&self, group: &str, index: u32, priority: u32) {
        self.record(RendererCall::Motion {
            group: group.to_owned(),
            index,
            priority,
        });
    }

    fn set_expression(&self, name: &str) {
        self.record(RendererCall::Expression(name.to_owned()));
    }
}
