//! Speaker output via cpal.
//!
//! One output stream runs for the lifetime of the sink on a dedicated
//! thread (cpal streams are not `Send` on every platform). Scheduled frames
//! are mixed into the stream at their start instants.

use crate::audio::{AudioFrame, PlaybackId, PlaybackSink};
use crate::config::PlaybackConfig;
use crate::error::{LipSyncError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{error, info};

struct Voice {
    id: PlaybackId,
    samples: Vec<f32>,
    start_at: std::time::Instant,
    /// Position on the rendered-sample clock, fixed by the first callback
    /// after scheduling.
    start_sample: Option<u64>,
}

struct Mixer {
    sample_rate: u32,
    clock: u64,
    next_id: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    /// Render one callback buffer whose first sample plays at `now`.
    ///
    /// Wall-clock start times are mapped onto the sample clock here, so
    /// stream startup latency and underruns never shift a voice.
    fn render(&mut self, now: std::time::Instant, data: &mut [f32]) {
        let (clock, rate) = (self.clock, f64::from(self.sample_rate));
        for v in &mut self.voices {
            if v.start_sample.is_none() {
                let ahead = v.start_at.saturating_duration_since(now);
                v.start_sample = Some(clock + (ahead.as_secs_f64() * rate).round() as u64);
            }
        }
        for out in data.iter_mut() {
            let t = self.clock;
            let mut acc = 0.0f32;
            for v in &self.voices {
                if let Some(start) = v.start_sample
                    && t >= start
                    && let Some(s) = v.samples.get((t - start) as usize)
                {
                    acc += *s;
                }
            }
            *out = acc.clamp(-1.0, 1.0);
            self.clock += 1;
        }
        let clock = self.clock;
        self.voices.retain(|v| {
            v.start_sample
                .is_none_or(|start| start + v.samples.len() as u64 > clock)
        });
    }
}

/// Audio playback to system speakers via cpal.
pub struct CpalSpeaker {
    mixer: Arc<Mutex<Mixer>>,
    shutdown: std::sync::mpsc::Sender<()>,
}

impl CpalSpeaker {
    /// Open the configured (or default) output device and start the stream.
    ///
    /// # Errors
    ///
    /// Returns [`LipSyncError::Playback`] if no output device is available or
    /// the stream cannot be started.
    pub fn new(config: &PlaybackConfig) -> Result<Self> {
        let sample_rate = config.output_sample_rate;
        let mixer = Arc::new(Mutex::new(Mixer {
            sample_rate,
            clock: 0,
            next_id: 0,
            voices: Vec::new(),
        }));

        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let device_name = config.output_device.clone();
        let thread_mixer = Arc::clone(&mixer);

        std::thread::Builder::new()
            .name("lipsync-speaker".into())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), sample_rate, thread_mixer)
                {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until the sink is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| LipSyncError::Playback(format!("failed to spawn speaker thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| LipSyncError::Playback("speaker thread exited during startup".into()))??;

        Ok(Self {
            mixer,
            shutdown: shutdown_tx,
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| LipSyncError::Playback(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

fn open_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| LipSyncError::Playback(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| LipSyncError::Playback(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| LipSyncError::Playback("no default output device".into()))?
    };

    let name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| match mixer.lock() {
                Ok(mut m) => m.render(std::time::Instant::now(), data),
                Err(_) => data.fill(0.0),
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| LipSyncError::Playback(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| LipSyncError::Playback(format!("failed to start output stream: {e}")))?;
    Ok(stream)
}

impl PlaybackSink for CpalSpeaker {
    fn start(&self, frame: Arc<AudioFrame>, at: Instant) -> Result<PlaybackId> {
        let mut m = self
            .mixer
            .lock()
            .map_err(|_| LipSyncError::Playback("mixer lock poisoned".into()))?;
        let samples = resample_linear_mono(&frame.samples, frame.sample_rate, m.sample_rate);
        let id = PlaybackId(m.next_id);
        m.next_id += 1;
        m.voices.push(Voice {
            id,
            samples,
            start_at: at.into_std(),
            start_sample: None,
        });
        Ok(id)
    }

    fn stop(&self, id: PlaybackId) {
        if let Ok(mut m) = self.mixer.lock() {
            m.voices.retain(|v| v.id != id);
        }
    }
}

fn resample_linear_mono(input: &[f32], from_sr: u32, to_sr: u32) -> Vec<f32> {
    if input.is_empty() || from_sr == to_sr || from_sr == 0 {
        return input.to_vec();
    }

    let ratio = f64::from(to_sr) / f64::from(from_sr);
    let out_len = ((input.len() as f64) * ratio).round() as usize;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let src_pos = (i as f64) / ratio;
            let i0 = (src_pos.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let t = (src_pos - i0 as f64) as f32;
            input[i0] * (1.0 - t) + input[i1] * t
        })
        .collect()
}
