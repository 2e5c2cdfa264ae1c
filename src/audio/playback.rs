//! Audio playback to system speakers via cpal.

use crate::audio::AudioSink;
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info};

/// How often the playback thread checks for completion or halt.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Audio playback to system speakers via cpal.
///
/// Each buffer is played on its own short-lived thread that owns the output
/// stream; [`AudioSink::halt`] flips a shared flag that the thread and the
/// stream callback both observe.
#[derive(Debug)]
pub struct CpalPlayback {
    output_device: Option<String>,
    halt: Option<Arc<AtomicBool>>,
}

impl CpalPlayback {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            output_device: config.output_device.clone(),
            halt: None,
        }
    }
}

impl AudioSink for CpalPlayback {
    fn play(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<oneshot::Receiver<()>> {
        self.halt();

        let halt = Arc::new(AtomicBool::new(false));
        self.halt = Some(Arc::clone(&halt));

        let (done_tx, done_rx) = oneshot::channel();
        let device_name = self.output_device.clone();

        std::thread::Builder::new()
            .name("voicelink-playback".into())
            .spawn(move || {
                if let Err(e) = play_blocking(device_name.as_deref(), samples, sample_rate, &halt)
                {
                    error!("playback error: {e}");
                }
                let _ = done_tx.send(());
            })?;

        Ok(done_rx)
    }

    fn halt(&mut self) {
        if let Some(flag) = self.halt.take() {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

/// Play `samples` and block until drained or halted.
fn play_blocking(
    device_name: Option<&str>,
    samples: Vec<f32>,
    sample_rate: u32,
    halt: &Arc<AtomicBool>,
) -> Result<()> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| SessionError::Device(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SessionError::Device(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| SessionError::Device("no default output device".into()))?
    };

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));

    let buffer_clone = Arc::clone(&buffer);
    let halt_clone = Arc::clone(halt);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                let halted = halt_clone.load(Ordering::Relaxed);

                for sample in data.iter_mut() {
                    if !halted && buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Device(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SessionError::Device(format!("failed to start output stream: {e}")))?;

    loop {
        std::thread::sleep(POLL_INTERVAL);
        if halt.load(Ordering::Relaxed) {
            info!("playback halted");
            break;
        }
        let buf = buffer
            .lock()
            .map_err(|e| SessionError::Device(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}
