//! Decode compressed or containerized audio payloads to mono f32.

use crate::audio::AudioFrame;
use crate::error::{LipSyncError, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decode an in-memory audio payload (WAV, MP3, AAC, MP4) into a mono frame.
///
/// `format_hint` is an optional file extension such as `"wav"` or `"mp3"`.
///
/// # Errors
///
/// Returns [`LipSyncError::Decode`] if the payload cannot be probed or
/// decoded, or decodes to no samples. No partial audio is returned.
pub fn decode_to_frame(payload: &[u8], format_hint: Option<&str>) -> Result<AudioFrame> {
    if payload.is_empty() {
        return Err(LipSyncError::Decode("empty audio payload".into()));
    }

    let cursor = std::io::Cursor::new(payload.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = format_hint {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LipSyncError::Decode(format!("failed to probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| LipSyncError::Decode("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| LipSyncError::Decode("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| LipSyncError::Decode(format!("failed to create decoder: {e}")))?;

    let mut out: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(LipSyncError::Decode(format!("audio read error: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // Corrupt packet: skip it, the rest of the stream may be fine.
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(LipSyncError::Decode(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let frames = decoded.frames() as u64;
        let required = usize::try_from(frames)
            .unwrap_or(usize::MAX)
            .saturating_mul(channels);

        let needs_new = sample_buf
            .as_ref()
            .is_none_or(|b| b.capacity() < required);
        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        } else if let Some(b) = sample_buf.as_mut() {
            b.clear();
        }
        if let Some(b) = sample_buf.as_mut() {
            b.copy_interleaved_ref(decoded);
        }

        let data = match sample_buf.as_ref() {
            Some(b) => b.samples(),
            None => &[],
        };
        if channels <= 1 {
            out.extend_from_slice(data);
        } else {
            out.extend(
                data.chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    if out.is_empty() {
        return Err(LipSyncError::Decode("decoded audio is empty".into()));
    }

    Ok(AudioFrame::new(out, sample_rate))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer
                    .write_sample((s * f32::from(i16::MAX)) as i16)
                    .unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_mono_wav() {
        let samples: Vec<f32> = (0..1600).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        let frame = decode_to_frame(&wav_bytes(&samples, 16_000, 1), Some("wav")).unwrap();
        assert_eq!(frame.sample_rate, 16_000);
        assert_eq!(frame.samples.len(), 1600);
        assert!((frame.samples[10] - samples[10]).abs() < 1e-3);
    }

    #[test]
    fn downmixes_stereo_wav() {
        // Interleaved L/R: left 0.5, right -0.5 averages to silence.
        let interleaved: Vec<f32> = (0..800).flat_map(|_| [0.5, -0.5]).collect();
        let frame = decode_to_frame(&wav_bytes(&interleaved, 22_050, 2), None).unwrap();
        assert_eq!(frame.samples.len(), 800);
        assert!(frame.samples.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let err = decode_to_frame(b"definitely not audio", Some("wav")).unwrap_err();
        assert!(matches!(err, LipSyncError::Decode(_)));
    }

    #[test]
    fn empty_payload_is_decode_error() {
        assert!(matches!(
            decode_to_frame(&[], None),
            Err(LipSyncError::Decode(_))
        ));
    }
}
