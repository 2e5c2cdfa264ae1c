//! In-memory audio devices for tests and headless hosts.
//!
//! [`ScriptedCapture`] stands in for a microphone whose frames are pushed by
//! the caller; [`RecordingSink`] stands in for a speaker that records every
//! buffer and completes playback only when told to.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioSink, CaptureDevice, FrameSink};
use crate::error::{Result, SessionError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

#[derive(Default)]
struct CaptureState {
    frames: Option<FrameSink>,
    cancel: Option<CancellationToken>,
    acquisitions: usize,
}

/// Microphone driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedCapture {
    state: Arc<Mutex<CaptureState>>,
    deny: bool,
}

impl ScriptedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone whose access is always denied.
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Push one raw frame as if the device callback fired.
    ///
    /// Returns `false` if the device is not currently acquired or the frame
    /// was dropped.
    pub fn push_frame(&self, frame: Vec<f32>) -> bool {
        let state = lock(&self.state);
        if !Self::active(&state) {
            return false;
        }
        state
            .frames
            .as_ref()
            .is_some_and(|sink| sink.push(frame))
    }

    /// Whether the device is acquired and not yet released.
    pub fn is_active(&self) -> bool {
        Self::active(&lock(&self.state))
    }

    /// How many times the device was acquired.
    pub fn acquisitions(&self) -> usize {
        lock(&self.state).acquisitions
    }

    fn active(state: &CaptureState) -> bool {
        state.cancel.as_ref().is_some_and(|c| !c.is_cancelled())
    }
}

#[async_trait]
impl CaptureDevice for ScriptedCapture {
    async fn start(&self, frames: FrameSink, cancel: CancellationToken) -> Result<()> {
        if self.deny {
            return Err(SessionError::Device("microphone permission denied".into()));
        }
        let mut state = lock(&self.state);
        state.frames = Some(frames);
        state.cancel = Some(cancel);
        state.acquisitions += 1;
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    buffers: Vec<Vec<f32>>,
    current: Option<oneshot::Sender<()>>,
    halts: usize,
}

/// Speaker that records buffers and finishes them on demand.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers handed to the device.
    pub fn play_count(&self) -> usize {
        lock(&self.state).buffers.len()
    }

    /// Every buffer played so far, in order.
    pub fn buffers(&self) -> Vec<Vec<f32>> {
        lock(&self.state).buffers.clone()
    }

    /// Number of `halt()` calls.
    pub fn halt_count(&self) -> usize {
        lock(&self.state).halts
    }

    /// Complete the in-flight buffer, as if the device drained it.
    pub fn finish_current(&self) {
        if let Some(done) = lock(&self.state).current.take() {
            let _ = done.send(());
        }
    }
}

impl AudioSink for RecordingSink {
    fn play(&mut self, samples: Vec<f32>, _sample_rate: u32) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        let mut state = lock(&self.state);
        state.buffers.push(samples);
        state.current = Some(tx);
        Ok(rx)
    }

    fn halt(&mut self) {
        let mut state = lock(&self.state);
        state.halts += 1;
        state.current = None;
    }
}
