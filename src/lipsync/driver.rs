//! The single animation timeline.

use crate::lipsync::controller::LipSyncController;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ticks a [`LipSyncController`] at the configured frame rate until
/// cancelled or dropped.
#[derive(Debug)]
pub struct FrameDriver {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FrameDriver {
    /// Spawn the frame loop on the current runtime.
    pub fn spawn(controller: LipSyncController) -> Self {
        let hz = controller.config().analyzer.frame_rate_hz.max(1);
        let period = Duration::from_secs_f64(1.0 / f64::from(hz));
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    at = interval.tick() => {
                        controller.tick(at);
                    }
                }
            }
            debug!("frame driver stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
