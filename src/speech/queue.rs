//! Ordered speech queue.
//!
//! Synthesis requests run concurrently, one task per chunk, while playback
//! is strictly sequential in enqueue order. A pending head blocks playback
//! of later chunks but never their synthesis.

use crate::audio::{BufferSource, PlaybackSink};
use crate::error::{LipSyncError, Result};
use crate::lipsync::{BufferProvider, LipSyncController, StopReason, UtteranceOutcome};
use crate::runtime::{self, RuntimeEvent};
use crate::speech::tts::Synthesizer;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Monotonic id assigned at enqueue.
pub type SequenceId = u64;

/// Plays one synthesized chunk and returns when it has finished.
#[async_trait]
pub trait SpeechPlayer: Send + Sync {
    /// Play `audio` to completion.
    ///
    /// # Errors
    ///
    /// Decode and playback errors; the queue skips the chunk and continues.
    async fn play(&self, audio: Bytes, format_hint: Option<&str>) -> Result<UtteranceOutcome>;

    /// Cut the current chunk short.
    fn interrupt(&self);
}

/// Counts reported when a queue drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    /// Chunks handed to the player.
    pub played: usize,
    /// Chunks dropped after a synthesis, decode, or playback failure.
    pub dropped: usize,
    /// Whether the queue was interrupted before draining.
    pub interrupted: bool,
}

enum Payload {
    Pending,
    Ready(Bytes),
    Failed(LipSyncError),
}

struct Slot {
    text: String,
    payload: Payload,
}

#[derive(Default)]
struct QueueState {
    next_id: SequenceId,
    slots: BTreeMap<SequenceId, Slot>,
    closed: bool,
    interrupted: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Notify,
    cancel: CancellationToken,
    events: Option<broadcast::Sender<RuntimeEvent>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-turn queue of speech chunks.
pub struct OrderedSpeechQueue {
    shared: Arc<Shared>,
    synth: Arc<dyn Synthesizer>,
    player: Arc<dyn SpeechPlayer>,
    summary: watch::Receiver<Option<QueueSummary>>,
}

impl std::fmt::Debug for OrderedSpeechQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("OrderedSpeechQueue")
            .field("next_id", &state.next_id)
            .field("queued", &state.slots.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl OrderedSpeechQueue {
    /// Create a queue and spawn its playback driver.
    pub fn new(synth: Arc<dyn Synthesizer>, player: Arc<dyn SpeechPlayer>) -> Self {
        Self::with_events(synth, player, None)
    }

    /// Create a queue reporting chunk progress on `events`.
    pub fn with_events(
        synth: Arc<dyn Synthesizer>,
        player: Arc<dyn SpeechPlayer>,
        events: Option<broadcast::Sender<RuntimeEvent>>,
    ) -> Self {
        Self::build(synth, player, events, CancellationToken::new())
    }

    /// Create a queue that stops with `turn`: cancelling the turn aborts
    /// synthesis and keeps further chunks from starting.
    pub fn for_turn(
        synth: Arc<dyn Synthesizer>,
        player: Arc<dyn SpeechPlayer>,
        events: Option<broadcast::Sender<RuntimeEvent>>,
        turn: &CancellationToken,
    ) -> Self {
        Self::build(synth, player, events, turn.child_token())
    }

    fn build(
        synth: Arc<dyn Synthesizer>,
        player: Arc<dyn SpeechPlayer>,
        events: Option<broadcast::Sender<RuntimeEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            cancel,
            events,
        });
        let hint = synth.format_hint().map(str::to_owned);
        let (summary_tx, summary) = watch::channel(None);
        let driver = run_driver(Arc::clone(&shared), Arc::clone(&player), hint);
        tokio::spawn(async move {
            let _ = summary_tx.send(Some(driver.await));
        });
        Self {
            shared,
            synth,
            player,
            summary,
        }
    }

    /// Queue `text` and start synthesizing it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Channel`] once the queue is finished or
    /// interrupted.
    pub fn enqueue(&self, text: impl Into<String>) -> Result<SequenceId> {
        let text = text.into();
        let id = {
            let mut state = self.shared.lock();
            if state.closed || state.interrupted {
                return Err(LipSyncError::Channel("speech queue is closed".into()));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.slots.insert(
                id,
                Slot {
                    text: text.clone(),
                    payload: Payload::Pending,
                },
            );
            id
        };
        debug!(sequence_id = id, "chunk enqueued");

        let shared = Arc::clone(&self.shared);
        let synth = Arc::clone(&self.synth);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                result = synth.synthesize(&text) => result,
            };
            {
                let mut state = shared.lock();
                let Some(slot) = state.slots.get_mut(&id) else {
                    return;
                };
                slot.payload = match result {
                    Ok(audio) => Payload::Ready(audio),
                    Err(e) => Payload::Failed(e),
                };
            }
            shared.ready.notify_one();
        });
        Ok(id)
    }

    /// Abort pending synthesis, empty the queue, and cut the current chunk.
    pub fn interrupt(&self) {
        {
            let mut state = self.shared.lock();
            if state.interrupted {
                return;
            }
            state.interrupted = true;
            state.slots.clear();
        }
        info!("speech queue interrupted");
        self.shared.cancel.cancel();
        self.player.interrupt();
        self.shared.ready.notify_one();
    }

    /// Close the queue to new text and wait for it to drain.
    ///
    /// May be raced against [`interrupt`](Self::interrupt); both take `&self`.
    pub async fn finish(&self) -> QueueSummary {
        self.shared.lock().closed = true;
        self.shared.ready.notify_one();
        let mut summary = self.summary.clone();
        match summary.wait_for(Option::is_some).await {
            Ok(done) => done.unwrap_or_default(),
            Err(_) => {
                warn!("speech queue driver ended without a summary");
                QueueSummary::default()
            }
        }
    }
}

impl Drop for OrderedSpeechQueue {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

enum Next {
    Play(SequenceId, Slot),
    Wait,
    Done,
}

async fn run_driver(
    shared: Arc<Shared>,
    player: Arc<dyn SpeechPlayer>,
    hint: Option<String>,
) -> QueueSummary {
    let mut summary = QueueSummary::default();
    let mut head: SequenceId = 0;

    loop {
        let next = {
            let mut state = shared.lock();
            if state.interrupted || shared.cancel.is_cancelled() {
                summary.interrupted = true;
                Next::Done
            } else {
                match state.slots.get(&head).map(|s| matches!(s.payload, Payload::Pending)) {
                    Some(false) => match state.slots.remove(&head) {
                        Some(slot) => Next::Play(head, slot),
                        None => Next::Wait,
                    },
                    Some(true) => Next::Wait,
                    None if state.closed && head >= state.next_id => Next::Done,
                    None => Next::Wait,
                }
            }
        };

        match next {
            Next::Done => break,
            Next::Wait => {
                tokio::select! {
                    _ = shared.ready.notified() => {}
                    _ = shared.cancel.cancelled() => {
                        summary.interrupted = true;
                        break;
                    }
                }
            }
            Next::Play(id, slot) => {
                head += 1;
                play_slot(&shared, player.as_ref(), hint.as_deref(), id, slot, &mut summary).await;
            }
        }
    }

    debug!(
        played = summary.played,
        dropped = summary.dropped,
        interrupted = summary.interrupted,
        "speech queue drained"
    );
    summary
}

async fn play_slot(
    shared: &Shared,
    player: &dyn SpeechPlayer,
    hint: Option<&str>,
    id: SequenceId,
    slot: Slot,
    summary: &mut QueueSummary,
) {
    let events = shared.events.as_ref();
    let audio = match slot.payload {
        Payload::Ready(audio) => audio,
        Payload::Failed(e) => {
            warn!(sequence_id = id, "dropping chunk: {e}");
            runtime::emit_error(events, &e);
            runtime::emit(events, RuntimeEvent::ChunkFinished { sequence_id: id, played: false });
            summary.dropped += 1;
            return;
        }
        Payload::Pending => return,
    };

    runtime::emit(
        events,
        RuntimeEvent::ChunkStarted {
            sequence_id: id,
            text: slot.text,
        },
    );
    let result = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Ok(UtteranceOutcome::Interrupted),
        result = player.play(audio, hint) => result,
    };
    match result {
        Ok(outcome) => {
            debug!(sequence_id = id, ?outcome, "chunk finished");
            summary.played += 1;
            runtime::emit(events, RuntimeEvent::ChunkFinished { sequence_id: id, played: true });
        }
        Err(e) => {
            warn!(sequence_id = id, "chunk playback failed: {e}");
            runtime::emit_error(events, &e);
            runtime::emit(events, RuntimeEvent::ChunkFinished { sequence_id: id, played: false });
            summary.dropped += 1;
        }
    }
}

/// Plays chunks through the lip-sync controller so the mouth follows them.
///
/// Interrupts only reach the utterance this player started; a newer one
/// on the shared controller is left alone.
#[derive(Clone)]
pub struct LipSyncPlayer {
    controller: LipSyncController,
    sink: Arc<dyn PlaybackSink>,
    current: Arc<Mutex<Option<u64>>>,
}

impl LipSyncPlayer {
    /// Play on `sink`, animating through `controller`.
    pub fn new(controller: LipSyncController, sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            controller,
            sink,
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<u64>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SpeechPlayer for LipSyncPlayer {
    async fn play(&self, audio: Bytes, format_hint: Option<&str>) -> Result<UtteranceOutcome> {
        let source = BufferSource::decode(&audio, format_hint, Arc::clone(&self.sink))?;
        let pending = self.controller.open_utterance();
        *self.current() = Some(pending.generation());
        let handle = self
            .controller
            .bind(pending, vec![Box::new(BufferProvider::new(source))])
            .await;
        Ok(handle.finished().await)
    }

    fn interrupt(&self) {
        if let Some(generation) = self.current().take() {
            self.controller
                .stop_generation(generation, StopReason::Interrupted);
        }
    }
}
