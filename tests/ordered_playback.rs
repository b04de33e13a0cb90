//! End-to-end text path: sentences synthesized out of order still play in
//! order, the mouth follows each chunk, and closes between and after them.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use bytes::Bytes;
use lipsync::audio::NullPlayback;
use lipsync::config::LipSyncConfig;
use lipsync::error::error_codes::SYNTHESIS_FAILURE;
use lipsync::renderer::AvatarRenderer;
use lipsync::runtime::RuntimeEvent;
use lipsync::speech::Synthesizer;
use lipsync::{Conversation, LipSyncError, Result};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const RATE: u32 = 16_000;

/// Renderer that timestamps every mouth write.
#[derive(Default)]
struct TimelineRenderer {
    writes: Mutex<Vec<(Instant, f32)>>,
}

impl TimelineRenderer {
    fn writes(&self) -> Vec<(Instant, f32)> {
        self.writes.lock().unwrap().clone()
    }
}

impl AvatarRenderer for TimelineRenderer {
    fn set_mouth_openness(&self, value: f32) {
        self.writes.lock().unwrap().push((Instant::now(), value));
    }
    fn on_hit(&self, _area: &str) {}
    fn play_motion(&self, _group: &str, _index: u32, _priority: u32) {}
    fn set_expression(&self, _name: &str) {}
}

/// Returns a 300 ms tone as WAV; the first sentence is slowest to synthesize.
struct ToneSynth {
    calls: Mutex<usize>,
}

fn tone_wav(ms: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let n = RATE * ms / 1000;
        for i in 0..n {
            let t = i as f32 / RATE as f32;
            let s = (t * 220.0 * std::f32::consts::TAU).sin() * 0.5;
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[async_trait]
impl Synthesizer for ToneSynth {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if text.contains("失敗") {
            return Err(LipSyncError::Synthesis("rejected".into()));
        }
        let delay = if call == 1 { 200 } else { 10 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(Bytes::from(tone_wav(300)))
    }

    fn format_hint(&self) -> Option<&str> {
        Some("wav")
    }
}

fn setup() -> (Conversation, Arc<TimelineRenderer>, Arc<NullPlayback>) {
    let renderer = Arc::new(TimelineRenderer::default());
    let sink = Arc::new(NullPlayback::new());
    let synth = Arc::new(ToneSynth {
        calls: Mutex::new(0),
    });
    let conversation = Conversation::new(
        LipSyncConfig::default(),
        renderer.clone(),
        sink.clone(),
        synth,
    )
    .unwrap();
    (conversation, renderer, sink)
}

#[tokio::test(start_paused = true)]
async fn two_sentences_play_in_order_with_mouth_following_audio() {
    let (conversation, renderer, sink) = setup();
    let mut events = conversation.subscribe();

    let summary = conversation
        .speak_text("こんにちは。元気ですか？")
        .await
        .unwrap();
    assert_eq!(summary.played, 2);
    assert_eq!(summary.dropped, 0);
    assert!(!summary.interrupted);

    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::ChunkStarted { sequence_id, text } = event {
            started.push((sequence_id, text));
        }
    }
    assert_eq!(
        started,
        vec![(0, "こんにちは。".to_owned()), (1, "元気ですか？".to_owned())]
    );

    let records = sink.records();
    assert_eq!(records.len(), 2);
    let first_end = records[0].start_at + records[0].duration;
    assert!(records[1].start_at >= first_end, "chunks overlap");

    let writes = renderer.writes();
    for rec in &records {
        let end = rec.start_at + rec.duration;
        assert!(
            writes
                .iter()
                .any(|(t, v)| *t >= rec.start_at && *t < end && *v > 0.5),
            "mouth never opened during a chunk"
        );
    }
    assert!(
        writes
            .iter()
            .any(|(t, v)| *t >= first_end && *t <= records[1].start_at && *v == 0.0),
        "mouth did not close between chunks"
    );
    assert_eq!(writes.last().map(|(_, v)| *v), Some(0.0));

    conversation.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_sentence_is_skipped_and_reported() {
    let (conversation, _renderer, sink) = setup();
    let mut events = conversation.subscribe();

    let summary = conversation
        .speak_text("失敗します。次はどうですか？")
        .await
        .unwrap();
    assert_eq!(summary.played, 1);
    assert_eq!(summary.dropped, 1);
    assert_eq!(sink.records().len(), 1);

    let mut saw_error = false;
    let mut unplayed = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            RuntimeEvent::Error { code, .. } => saw_error |= code == SYNTHESIS_FAILURE,
            RuntimeEvent::ChunkFinished {
                sequence_id,
                played: false,
            } => unplayed.push(sequence_id),
            _ => {}
        }
    }
    assert!(saw_error);
    assert_eq!(unplayed, vec![0]);

    conversation.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_reply_closes_mouth() {
    let (conversation, renderer, sink) = setup();
    let conversation = Arc::new(conversation);

    let speaking = {
        let conversation = Arc::clone(&conversation);
        tokio::spawn(async move { conversation.speak_text("こんにちは。元気ですか？").await })
    };
    tokio::time::sleep(Duration::from_millis(350)).await;
    conversation.disconnect();

    let summary = speaking.await.unwrap().unwrap();
    assert!(summary.interrupted);
    assert!(summary.played < 2);
    assert_eq!(renderer.writes().last().map(|(_, v)| *v), Some(0.0));
    assert!(sink.audible_at(Instant::now()).is_empty());

    conversation.shutdown().await;
}
