//! Speech output: sentence splitting, synthesis, and ordered playback.

pub mod queue;
pub mod splitter;
pub mod tts;

pub use queue::{LipSyncPlayer, OrderedSpeechQueue, QueueSummary, SequenceId, SpeechPlayer};
pub use splitter::SentenceSplitter;
pub use tts::{HttpSynthesizer, Synthesizer};
