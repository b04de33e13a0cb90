//! Lip-sync session controller.
//!
//! Owns the lifecycle of one speaking session:
//!
//! ```text
//! Idle -> AcquiringSource -> Bound(strategy) | Fallback -> Closing -> Idle
//! ```
//!
//! The controller is the only writer of the renderer's mouth parameter. All
//! session state sits behind one mutex that is never held across an await;
//! a generation counter discards late results from superseded sessions.

use crate::audio::AnalyzableSignal;
use crate::config::LipSyncConfig;
use crate::error::{LipSyncError, Result};
use crate::lipsync::analyzer::{Reading, SignalAnalyzer};
use crate::lipsync::fallback::SyntheticFallback;
use crate::lipsync::mapper::MouthMapper;
use crate::lipsync::source::{SourceProvider, SourceStrategy, order_by_priority};
use crate::renderer::AvatarRenderer;
use crate::runtime::{self, RuntimeEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; mouth closed.
    Idle,
    /// Trying source strategies in priority order.
    AcquiringSource,
    /// A signal is bound and analyzed every frame.
    Bound(SourceStrategy),
    /// No signal could be bound; synthetic animation runs.
    Fallback,
    /// Mouth decaying closed after natural completion.
    Closing,
}

/// Why an utterance is being stopped from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Upstream interrupt (barge-in, transport `interrupted`).
    Interrupted,
    /// Host asked to stop.
    Explicit,
}

/// How an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceOutcome {
    /// The bound signal played out and the mouth decayed closed.
    Completed,
    /// Synthetic animation ran its full duration.
    FallbackElapsed,
    /// Stopped by an upstream interrupt.
    Interrupted,
    /// Stopped by the host.
    Stopped,
    /// A newer utterance took over.
    Superseded,
    /// The bound signal vanished.
    SourceLost,
}

impl From<StopReason> for UtteranceOutcome {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Interrupted => Self::Interrupted,
            StopReason::Explicit => Self::Stopped,
        }
    }
}

/// Handle to one utterance, resolving when it ends.
#[derive(Debug)]
pub struct UtteranceHandle {
    generation: u64,
    outcome: oneshot::Receiver<UtteranceOutcome>,
}

impl UtteranceHandle {
    /// Session generation this utterance runs under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the utterance to end.
    ///
    /// Resolves to [`UtteranceOutcome::Stopped`] if the controller is
    /// dropped first.
    pub async fn finished(self) -> UtteranceOutcome {
        self.outcome.await.unwrap_or(UtteranceOutcome::Stopped)
    }
}

/// An utterance whose session is open but has no source bound yet.
///
/// The controller is already `AcquiringSource` when this exists, so a stop
/// issued before [`LipSyncController::bind`] runs takes effect.
#[derive(Debug)]
pub struct PendingUtterance {
    handle: UtteranceHandle,
    cancel: CancellationToken,
}

impl PendingUtterance {
    /// Session generation this utterance runs under.
    pub fn generation(&self) -> u64 {
        self.handle.generation
    }
}

struct Inner {
    generation: u64,
    state: SessionState,
    acquiring: CancellationToken,
    input_ended: bool,
    signal: Option<Box<dyn AnalyzableSignal>>,
    fallback: Option<SyntheticFallback>,
    outcome: Option<oneshot::Sender<UtteranceOutcome>>,
    analyzer: SignalAnalyzer,
    mapper: MouthMapper,
}

/// Drives the renderer's mouth from whichever audio source can be bound.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct LipSyncController {
    inner: Arc<Mutex<Inner>>,
    renderer: Arc<dyn AvatarRenderer>,
    config: Arc<LipSyncConfig>,
    events: Option<broadcast::Sender<RuntimeEvent>>,
}

impl std::fmt::Debug for LipSyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LipSyncController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LipSyncController {
    /// Create an idle controller writing to `renderer`.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Config`] if `config` fails validation.
    pub fn new(config: &LipSyncConfig, renderer: Arc<dyn AvatarRenderer>) -> Result<Self> {
        config.validate()?;
        let inner = Inner {
            generation: 0,
            state: SessionState::Idle,
            acquiring: CancellationToken::new(),
            input_ended: false,
            signal: None,
            fallback: None,
            outcome: None,
            analyzer: SignalAnalyzer::new(&config.analyzer, config.mapper.rms_scale),
            mapper: MouthMapper::new(config.mapper.clone()),
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            renderer,
            config: Arc::new(config.clone()),
            events: None,
        })
    }

    /// Report state changes on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Configuration this controller was built with.
    pub fn config(&self) -> &LipSyncConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Current session generation.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Last mouth value written.
    pub fn mouth(&self) -> f32 {
        self.lock().mapper.current()
    }

    /// Start a new utterance.
    ///
    /// Any previous session is closed first: its signal is released and the
    /// mouth written to 0 before acquisition begins. `providers` are tried in
    /// the configured priority order, each bounded by the attempt timeout; if
    /// none yields a signal the session enters synthetic fallback.
    pub async fn begin_utterance(&self, providers: Vec<Box<dyn SourceProvider>>) -> UtteranceHandle {
        let pending = self.open_utterance();
        self.bind(pending, providers).await
    }

    /// Synchronous half of [`begin_utterance`](Self::begin_utterance): close
    /// any previous session and enter `AcquiringSource` under a new
    /// generation.
    pub fn open_utterance(&self) -> PendingUtterance {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let mut inner = self.lock();
        if inner.state != SessionState::Idle {
            debug!(generation = inner.generation, "superseding active utterance");
            self.close_now(&mut inner, UtteranceOutcome::Superseded, false);
        }
        inner.generation += 1;
        inner.outcome = Some(tx);
        inner.acquiring = cancel.clone();
        inner.input_ended = false;
        self.set_state(&mut inner, SessionState::AcquiringSource);
        PendingUtterance {
            handle: UtteranceHandle {
                generation: inner.generation,
                outcome: rx,
            },
            cancel,
        }
    }

    /// Acquire a source for an opened utterance and bind it.
    ///
    /// If the utterance was stopped or superseded meanwhile, acquisition is
    /// abandoned and any late signal released.
    pub async fn bind(
        &self,
        pending: PendingUtterance,
        providers: Vec<Box<dyn SourceProvider>>,
    ) -> UtteranceHandle {
        let PendingUtterance { handle, cancel } = pending;
        let generation = handle.generation;
        let acquired = self.acquire(providers, &cancel).await;

        let mut inner = self.lock();
        if inner.generation != generation {
            if let Some((strategy, mut signal)) = acquired {
                debug!(%strategy, generation, "releasing late signal from superseded session");
                signal.release();
            }
            return handle;
        }
        match acquired {
            Some((strategy, mut signal)) => {
                info!(%strategy, generation, "audio source bound");
                if inner.input_ended {
                    signal.end_of_input();
                }
                inner.signal = Some(signal);
                inner.mapper.reset();
                self.set_state(&mut inner, SessionState::Bound(strategy));
                self.fire_speaking_triggers();
            }
            None if inner.input_ended => {
                debug!(generation, "input ended before any source bound");
                self.close_now(&mut inner, UtteranceOutcome::Completed, true);
            }
            None => {
                let err = LipSyncError::SourceUnavailable(
                    "no audio source could be bound; using synthetic animation".into(),
                );
                warn!(generation, "{err}");
                runtime::emit_error(self.events.as_ref(), &err);
                inner.fallback = Some(SyntheticFallback::start(
                    self.config.fallback.clone(),
                    Instant::now(),
                ));
                self.set_state(&mut inner, SessionState::Fallback);
                self.fire_speaking_triggers();
            }
        }
        handle
    }

    /// Advance one animation frame at `now` and return the value written.
    ///
    /// Idle and acquiring sessions write nothing.
    pub fn tick(&self, now: Instant) -> f32 {
        let mut inner = self.lock();
        let value = match inner.state {
            SessionState::Idle | SessionState::AcquiringSource => return inner.mapper.current(),
            SessionState::Bound(_) => self.tick_bound(&mut inner, now),
            SessionState::Fallback => self.tick_fallback(&mut inner, now),
            SessionState::Closing => self.tick_closing(&mut inner),
        };
        self.renderer.set_mouth_openness(value);
        value
    }

    /// Stop the current utterance immediately.
    ///
    /// Releases the bound signal, discards anything it scheduled, and writes
    /// 0 within the calling task turn. A no-op when idle.
    pub fn stop(&self, reason: StopReason) {
        let mut inner = self.lock();
        if inner.state == SessionState::Idle {
            return;
        }
        inner.generation += 1;
        debug!(?reason, generation = inner.generation, "stopping utterance");
        self.close_now(&mut inner, reason.into(), true);
    }

    /// Stop the utterance running under `generation`.
    ///
    /// Does nothing and returns `false` if a newer utterance has taken over
    /// or the controller is idle.
    pub fn stop_generation(&self, generation: u64, reason: StopReason) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state == SessionState::Idle {
            return false;
        }
        inner.generation += 1;
        debug!(?reason, generation, "stopping utterance");
        self.close_now(&mut inner, reason.into(), true);
        true
    }

    /// No more audio will arrive for the utterance under `generation`.
    ///
    /// A bound signal plays out what it already holds and then decays closed.
    /// If nothing is bound by the time acquisition gives up, the session
    /// closes instead of falling back to synthetic animation.
    pub fn complete(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.input_ended = true;
        if let Some(signal) = inner.signal.as_mut() {
            signal.end_of_input();
        }
    }

    fn tick_bound(&self, inner: &mut Inner, now: Instant) -> f32 {
        let Inner {
            signal,
            analyzer,
            mapper,
            ..
        } = &mut *inner;
        let reading = match signal.as_mut() {
            Some(signal) => analyzer.sample(signal.as_mut(), now),
            None => Reading::Lost,
        };
        match reading {
            Reading::Level(raw) => mapper.apply(raw),
            Reading::Exhausted => {
                if let Some(mut signal) = signal.take() {
                    signal.release();
                }
                mapper.begin_decay();
                self.set_state(inner, SessionState::Closing);
                self.tick_closing(inner)
            }
            Reading::Lost => {
                warn!("bound audio source lost");
                self.close_now(inner, UtteranceOutcome::SourceLost, true);
                0.0
            }
        }
    }

    fn tick_fallback(&self, inner: &mut Inner, now: Instant) -> f32 {
        match inner.fallback.as_ref().and_then(|f| f.value_at(now)) {
            Some(v) => {
                inner.mapper.set_current(v);
                v
            }
            None => {
                debug!("synthetic animation elapsed");
                inner.fallback = None;
                inner.mapper.reset();
                self.finish(inner, UtteranceOutcome::FallbackElapsed, true);
                0.0
            }
        }
    }

    fn tick_closing(&self, inner: &mut Inner) -> f32 {
        let value = inner.mapper.decay_step().unwrap_or(0.0);
        if !inner.mapper.is_decaying() {
            inner.mapper.reset();
            self.finish(inner, UtteranceOutcome::Completed, true);
            return 0.0;
        }
        value
    }

    /// Release resources, snap the mouth to 0, resolve the outcome.
    fn close_now(&self, inner: &mut Inner, outcome: UtteranceOutcome, announce_idle: bool) {
        self.set_state(inner, SessionState::Closing);
        inner.acquiring.cancel();
        if let Some(mut signal) = inner.signal.take() {
            signal.release();
        }
        inner.fallback = None;
        inner.mapper.reset();
        self.renderer.set_mouth_openness(0.0);
        self.finish(inner, outcome, announce_idle);
    }

    fn finish(&self, inner: &mut Inner, outcome: UtteranceOutcome, announce_idle: bool) {
        if let Some(tx) = inner.outcome.take() {
            let _ = tx.send(outcome);
        }
        debug!(?outcome, generation = inner.generation, "utterance finished");
        self.set_state(inner, SessionState::Idle);
        if announce_idle && let Some(expression) = &self.config.avatar.idle_expression {
            self.renderer.set_expression(expression);
        }
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        if inner.state != state {
            inner.state = state;
            runtime::emit(self.events.as_ref(), RuntimeEvent::LipSyncState(state));
        }
    }

    fn fire_speaking_triggers(&self) {
        let avatar = &self.config.avatar;
        if let Some(motion) = &avatar.speaking_motion {
            self.renderer
                .play_motion(&motion.group, motion.index, motion.priority);
        }
        if let Some(expression) = &avatar.speaking_expression {
            self.renderer.set_expression(expression);
        }
    }

    async fn acquire(
        &self,
        providers: Vec<Box<dyn SourceProvider>>,
        cancel: &CancellationToken,
    ) -> Option<(SourceStrategy, Box<dyn AnalyzableSignal>)> {
        let attempt_timeout = Duration::from_millis(self.config.acquisition.attempt_timeout_ms);
        for provider in order_by_priority(providers, &self.config.acquisition.priority) {
            let strategy = provider.strategy();
            let attempt = tokio::time::timeout(attempt_timeout, provider.acquire());
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(%strategy, "acquisition abandoned");
                    return None;
                }
                result = attempt => result,
            };
            match result {
                Ok(Ok(signal)) => return Some((strategy, signal)),
                Ok(Err(e)) => debug!(%strategy, error = %e, "source strategy unavailable"),
                Err(_) => debug!(%strategy, ?attempt_timeout, "source strategy timed out"),
            }
        }
        None
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
