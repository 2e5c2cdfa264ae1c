//! Microphone audio capture using cpal.
//!
//! Captures at the device's native sample rate and downsamples to the wire
//! input rate (16kHz mono).

use crate::audio::{CaptureDevice, FrameSink};
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Audio capture from the system microphone via cpal.
///
/// The cpal stream lives on a dedicated thread for as long as the capture is
/// active, so nothing here needs to be `Send`-safe across awaits.
#[derive(Debug, Clone)]
pub struct CpalCapture {
    input_device: Option<String>,
    target_sample_rate: u32,
}

impl CpalCapture {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            input_device: config.input_device.clone(),
            target_sample_rate: config.input_sample_rate,
        }
    }
}

#[async_trait]
impl CaptureDevice for CpalCapture {
    async fn start(
        &self,
        frames: FrameSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_name = self.input_device.clone();
        let target_rate = self.target_sample_rate;
        let runtime = tokio::runtime::Handle::current();

        std::thread::Builder::new()
            .name("voicelink-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(device_name.as_deref(), target_rate, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                // Hold the stream alive until cancelled
                runtime.block_on(cancel.cancelled());
                drop(stream);
                info!("audio capture stopped");
            })?;

        ready_rx
            .await
            .map_err(|_| SessionError::Device("capture thread exited before starting".into()))?
    }
}

fn open_input_stream(
    device_name: Option<&str>,
    target_rate: u32,
    frames: FrameSink,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| SessionError::Device(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SessionError::Device(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| SessionError::Device("no default input device".into()))?
    };

    let default_config = device
        .default_input_config()
        .map_err(|e| SessionError::Device(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };

                let samples = if native_rate != target_rate {
                    downsample(&mono, native_rate, target_rate)
                } else {
                    mono
                };

                // Never block the audio thread.
                if !frames.push(samples) {
                    debug!("capture channel full, dropping frame");
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Device(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SessionError::Device(format!("failed to start input stream: {e}")))?;

    info!(
        "audio capture started: native {}Hz x{} -> {}Hz mono",
        native_rate, native_channels, target_rate
    );
    Ok(stream)
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Speech energy sits below 8kHz, so no anti-alias filter is applied for
/// 48kHz -> 16kHz.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
