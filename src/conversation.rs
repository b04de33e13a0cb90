//! Per-turn conversation flows.
//!
//! Wires a transport reply through the speech queue (text paths) or the
//! scheduled-chunk timeline (realtime path) into the lip-sync controller,
//! and reports progress on the [`RuntimeEvent`] broadcast.

use crate::audio::{AudioEnvironment, PlaybackSink, ScheduledChunkSource};
use crate::config::LipSyncConfig;
use crate::error::{LipSyncError, Result};
use crate::lipsync::{
    EnvironmentProvider, FrameDriver, LipSyncController, ScheduledCaptureProvider, SessionState,
    SourceProvider, SourceStrategy, StopReason, TransportTapProvider,
};
use crate::renderer::AvatarRenderer;
use crate::runtime::{self, ConnectionState, RuntimeEvent, Speaker};
use crate::speech::{LipSyncPlayer, OrderedSpeechQueue, QueueSummary, SentenceSplitter, Synthesizer};
use crate::transport::{
    ChatMessage, RealtimeEvent, RealtimeTransport, StreamingTextTransport, TextTransport,
};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ring capacity of stream taps, in samples.
const TAP_CAPACITY: usize = 4096;

/// A talking avatar: one controller, one playback sink, one synthesizer.
///
/// Must be created inside a tokio runtime; it spawns the animation loop.
pub struct Conversation {
    config: LipSyncConfig,
    renderer: Arc<dyn AvatarRenderer>,
    controller: LipSyncController,
    sink: Arc<dyn PlaybackSink>,
    synth: Arc<dyn Synthesizer>,
    environment: AudioEnvironment,
    events: broadcast::Sender<RuntimeEvent>,
    turn: Mutex<CancellationToken>,
    driver: Mutex<Option<FrameDriver>>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("controller", &self.controller)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl Conversation {
    /// Build the engine and start its frame loop.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Config`] if `config` fails validation.
    pub fn new(
        config: LipSyncConfig,
        renderer: Arc<dyn AvatarRenderer>,
        sink: Arc<dyn PlaybackSink>,
        synth: Arc<dyn Synthesizer>,
    ) -> Result<Self> {
        let (events, _) = runtime::event_channel();
        let controller =
            LipSyncController::new(&config, Arc::clone(&renderer))?.with_events(events.clone());
        let driver = FrameDriver::spawn(controller.clone());
        Ok(Self {
            config,
            renderer,
            controller,
            sink,
            synth,
            environment: AudioEnvironment::new(),
            events,
            turn: Mutex::new(CancellationToken::new()),
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// The lip-sync controller.
    pub fn controller(&self) -> &LipSyncController {
        &self.controller
    }

    /// Registry where the host publishes live audio streams.
    pub fn environment(&self) -> &AudioEnvironment {
        &self.environment
    }

    /// Forward a hit-area interaction to the character.
    pub fn on_hit(&self, area: &str) {
        self.renderer.on_hit(area);
    }

    /// Split `text` into sentences and speak them in order.
    ///
    /// # Errors
    ///
    /// Only internal queue errors; synthesis and playback failures are
    /// contained and reported as events.
    pub async fn speak_text(&self, text: &str) -> Result<QueueSummary> {
        let cancel = self.begin_turn();
        let queue = self.new_queue(&cancel);
        for chunk in SentenceSplitter::split_all(&self.config.speech, text) {
            queue.enqueue(chunk)?;
        }
        Ok(self.drain(&queue, &cancel).await)
    }

    /// Ask for a one-shot reply and speak it.
    ///
    /// # Errors
    ///
    /// Returns the transport's error; the avatar is left untouched.
    pub async fn respond(
        &self,
        transport: &dyn TextTransport,
        history: &[ChatMessage],
    ) -> Result<String> {
        let reply = transport
            .send_conversation(history)
            .await
            .inspect_err(|e| self.report(e))?;
        self.transcript(Speaker::Assistant, &reply);
        self.speak_text(&reply).await?;
        Ok(reply)
    }

    /// Stream a reply, speaking each sentence as soon as it completes.
    ///
    /// Returns the full reply text.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, whether it failed before or during
    /// the stream. Sentences already queued are still spoken.
    pub async fn respond_streaming(
        &self,
        transport: &dyn StreamingTextTransport,
        history: &[ChatMessage],
    ) -> Result<String> {
        let cancel = self.begin_turn();
        let mut stream = transport
            .stream_conversation(history)
            .await
            .inspect_err(|e| self.report(e))?;

        let queue = self.new_queue(&cancel);
        let mut splitter = SentenceSplitter::new(&self.config.speech);
        let mut reply = String::new();
        let mut failure = None;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    queue.interrupt();
                    break;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(delta)) => {
                    reply.push_str(&delta);
                    self.transcript(Speaker::Assistant, &delta);
                    for chunk in splitter.push(&delta) {
                        queue.enqueue(chunk)?;
                    }
                }
                Some(Err(e)) => {
                    self.report(&e);
                    failure = Some(e);
                    break;
                }
                None => break,
            }
        }

        if failure.is_none()
            && !cancel.is_cancelled()
            && let Some(rest) = splitter.flush()
        {
            queue.enqueue(rest)?;
        }
        let summary = self.drain(&queue, &cancel).await;
        debug!(played = summary.played, dropped = summary.dropped, "streamed reply spoken");
        match failure {
            Some(e) => Err(e),
            None => Ok(reply),
        }
    }

    /// Run a realtime session until it closes or [`disconnect`](Self::disconnect)
    /// is called.
    ///
    /// A transport that exposes an audio tap plays its own audio: its frames
    /// are only analyzed, never scheduled on the sink. When the session ends
    /// for any reason, unplayed audio is discarded and the mouth closed.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Transport`] if the session's events were
    /// already taken.
    pub async fn run_realtime(&self, session: &dyn RealtimeTransport) -> Result<()> {
        let mut events = session.events().ok_or_else(|| {
            LipSyncError::Transport("realtime session events already taken".into())
        })?;
        let cancel = self.begin_turn();
        let scheduled = ScheduledChunkSource::new(
            Arc::clone(&self.sink),
            Duration::from_millis(self.config.playback.min_lead_ms),
        );
        let plays_itself = session.audio_tap().is_some();
        runtime::emit(
            Some(&self.events),
            RuntimeEvent::ConnectionState(ConnectionState::Connected),
        );

        let mut utterance: Option<u64> = None;
        let mut in_turn = false;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(RealtimeEvent::Audio(frame)) => {
                    if !plays_itself && let Err(e) = scheduled.push(frame) {
                        warn!("dropping realtime audio: {e}");
                        self.report(&e);
                        continue;
                    }
                    if !in_turn {
                        in_turn = true;
                        utterance = Some(self.begin_realtime_utterance(
                            session,
                            &scheduled,
                            utterance,
                        ));
                    }
                }
                Some(RealtimeEvent::TextDelta(text)) => {
                    self.transcript(Speaker::Assistant, &text);
                    // Live streams can bind before any audio event arrives.
                    let live = plays_itself || self.environment.subscribe_first().is_some();
                    if !in_turn && live {
                        in_turn = true;
                        utterance = Some(self.begin_realtime_utterance(
                            session,
                            &scheduled,
                            utterance,
                        ));
                    }
                }
                Some(RealtimeEvent::TurnComplete) => {
                    debug!("realtime turn complete");
                    scheduled.finish_turn();
                    if let Some(generation) = utterance {
                        self.controller.complete(generation);
                    }
                    in_turn = false;
                }
                Some(RealtimeEvent::Interrupted) => {
                    let discarded = scheduled.discard();
                    if let Some(generation) = utterance.take() {
                        self.controller
                            .stop_generation(generation, StopReason::Interrupted);
                    }
                    info!(discarded, "realtime turn interrupted");
                    in_turn = false;
                }
                Some(RealtimeEvent::Error(message)) => {
                    self.report(&LipSyncError::Transport(message));
                }
                Some(RealtimeEvent::Closed) | None => break,
            }
        }

        let discarded = scheduled.discard();
        if let Some(generation) = utterance {
            self.controller
                .stop_generation(generation, StopReason::Explicit);
        }
        debug!(discarded, "realtime session ended");
        runtime::emit(
            Some(&self.events),
            RuntimeEvent::ConnectionState(ConnectionState::Disconnected),
        );
        Ok(())
    }

    /// Stop everything in flight and close the mouth.
    pub fn disconnect(&self) {
        self.turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.controller.stop(StopReason::Explicit);
        self.renderer.set_mouth_openness(0.0);
        info!("conversation disconnected");
    }

    /// Disconnect and stop the animation loop.
    pub async fn shutdown(&self) {
        self.disconnect();
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.shutdown().await;
        }
    }

    /// Cancel the previous turn and start a new one.
    fn begin_turn(&self) -> CancellationToken {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        turn.cancel();
        *turn = CancellationToken::new();
        turn.clone()
    }

    fn new_queue(&self, turn: &CancellationToken) -> OrderedSpeechQueue {
        let player = LipSyncPlayer::new(self.controller.clone(), Arc::clone(&self.sink));
        OrderedSpeechQueue::for_turn(
            Arc::clone(&self.synth),
            Arc::new(player),
            Some(self.events.clone()),
            turn,
        )
    }

    async fn drain(&self, queue: &OrderedSpeechQueue, cancel: &CancellationToken) -> QueueSummary {
        tokio::select! {
            summary = queue.finish() => summary,
            _ = cancel.cancelled() => {
                queue.interrupt();
                queue.finish().await
            }
        }
    }

    /// Begin lip-sync for a realtime turn and return its generation.
    ///
    /// If the previous turn's timeline is still bound, the new audio simply
    /// extends it. The utterance is opened before anything is spawned, so an
    /// interrupt handled right after this call stops it.
    fn begin_realtime_utterance(
        &self,
        session: &dyn RealtimeTransport,
        scheduled: &ScheduledChunkSource,
        previous: Option<u64>,
    ) -> u64 {
        let tap = session.audio_tap();
        if let Some(generation) = previous
            && tap.is_none()
            && generation == self.controller.generation()
            && self.controller.state() == SessionState::Bound(SourceStrategy::ScheduledCapture)
        {
            return generation;
        }
        let stale = Duration::from_millis(self.config.playback.stream_stale_ms);
        let mut providers: Vec<Box<dyn SourceProvider>> = Vec::new();
        let plays_itself = tap.is_some();
        if let Some(tap) = tap {
            providers.push(Box::new(TransportTapProvider::new(tap, TAP_CAPACITY, stale)));
        }
        if self.environment.subscribe_first().is_some() {
            providers.push(Box::new(EnvironmentProvider::new(
                self.environment.clone(),
                TAP_CAPACITY,
                stale,
            )));
        }
        if !plays_itself {
            providers.push(Box::new(ScheduledCaptureProvider::new(scheduled.clone())));
        }

        let pending = self.controller.open_utterance();
        let generation = pending.generation();
        let controller = self.controller.clone();
        tokio::spawn(async move {
            let handle = controller.bind(pending, providers).await;
            let outcome = handle.finished().await;
            debug!(?outcome, "realtime utterance ended");
        });
        generation
    }

    fn transcript(&self, speaker: Speaker, text: &str) {
        runtime::emit(
            Some(&self.events),
            RuntimeEvent::Transcript {
                speaker,
                text: text.to_owned(),
            },
        );
    }

    fn report(&self, err: &LipSyncError) {
        if !err.is_contained() {
            warn!("{err}");
        }
        runtime::emit_error(Some(&self.events), err);
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.controller.stop(StopReason::Explicit);
    }
}
