//! Runtime events emitted for UI and observability.
//!
//! Events are lightweight so audio paths can emit them without blocking.
//! Emission is best-effort: a broadcast with no receivers is not an error.

use crate::lipsync::controller::SessionState;
use tokio::sync::broadcast;

/// Broadcast capacity for [`RuntimeEvent`] channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Which side of the conversation a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

/// Events that describe what the engine is doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Transport connection changed.
    ConnectionState(ConnectionState),
    /// Transcript text (a delta for streamed replies, whole text otherwise).
    Transcript { speaker: Speaker, text: String },
    /// A speech chunk began playing.
    ChunkStarted { sequence_id: u64, text: String },
    /// A speech chunk stopped playing (or was dropped before playing).
    ChunkFinished { sequence_id: u64, played: bool },
    /// The lip-sync controller changed state.
    LipSyncState(SessionState),
    /// A contained or surfaced failure, tagged with its stable error code.
    Error { code: &'static str, message: String },
}

/// Create a runtime event channel with the default capacity.
pub fn event_channel() -> (broadcast::Sender<RuntimeEvent>, broadcast::Receiver<RuntimeEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Send `event` if a sender is present, ignoring the no-receiver case.
pub(crate) fn emit(tx: Option<&broadcast::Sender<RuntimeEvent>>, event: RuntimeEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Report `err` as a [`RuntimeEvent::Error`].
pub(crate) fn emit_error(tx: Option<&broadcast::Sender<RuntimeEvent>>, err: &crate::error::LipSyncError) {
    emit(
        tx,
        RuntimeEvent::Error {
            code: err.code(),
            message: err.to_string(),
        },
    );
}
