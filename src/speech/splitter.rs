//! Sentence splitting for streamed text.

use crate::config::SpeechConfig;

/// Splits incrementally arriving text into playable chunks.
///
/// Every terminator ends a chunk. A completed chunk whose trimmed length is
/// at most `min_chunk_chars` is not emitted on its own; it stays in the
/// buffer and becomes the prefix of the next chunk. Text after the last
/// terminator is held until more text arrives or [`flush`](Self::flush).
#[derive(Debug, Clone)]
pub struct SentenceSplitter {
    terminators: Vec<char>,
    min_chunk_chars: usize,
    buffer: String,
    /// Byte offset up to which the buffer has already been scanned.
    scanned: usize,
}

impl SentenceSplitter {
    /// Create a splitter from the speech configuration.
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            terminators: config.terminators.clone(),
            min_chunk_chars: config.min_chunk_chars,
            buffer: String::new(),
            scanned: 0,
        }
    }

    /// Append `delta` and return every chunk it completes, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut chunks = Vec::new();
        let mut start = 0;

        let mut boundaries = Vec::new();
        for (i, c) in self.buffer[self.scanned..].char_indices() {
            if self.terminators.contains(&c) {
                boundaries.push(self.scanned + i + c.len_utf8());
            }
        }

        for end in boundaries {
            let candidate = self.buffer[start..end].trim();
            if candidate.chars().count() <= self.min_chunk_chars {
                continue;
            }
            chunks.push(candidate.to_owned());
            start = end;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        chunks
    }

    /// Emit everything held, regardless of length.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_owned();
        self.buffer.clear();
        self.scanned = 0;
        (!rest.is_empty()).then_some(rest)
    }

    /// Text currently held back.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Split a complete text in one call (push then flush).
    pub fn split_all(config: &SpeechConfig, text: &str) -> Vec<String> {
        let mut splitter = Self::new(config);
        let mut chunks = splitter.push(text);
        chunks.extend(splitter.flush());
        chunks
    }
}
