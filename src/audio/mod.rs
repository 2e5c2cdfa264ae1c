//! Microphone and speaker devices.
//!
//! The session talks to audio hardware only through [`CaptureDevice`] and
//! [`AudioSink`]; the cpal implementations live in [`capture`] and
//! [`playback`].

pub mod capture;
pub mod playback;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use capture::CpalCapture;
pub use playback::CpalPlayback;

/// Whether captured audio may be sent, and which gate period it belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureGate {
    pub open: bool,
    /// Bumped every time `open` flips.
    pub epoch: u64,
}

impl CaptureGate {
    /// The gate with `open` applied. The epoch only moves on a flip.
    #[must_use]
    pub fn with_open(self, open: bool) -> Self {
        if self.open == open {
            self
        } else {
            Self {
                open,
                epoch: self.epoch.wrapping_add(1),
            }
        }
    }
}

/// One raw device buffer, stamped with the gate epoch current when it was
/// captured.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub epoch: u64,
    pub samples: Vec<f32>,
}

/// Where a [`CaptureDevice`] delivers frames.
///
/// Safe to call from a realtime audio callback: stamping reads the gate
/// without waiting, and a full queue drops the frame.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<CapturedFrame>,
    gate: watch::Receiver<CaptureGate>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<CapturedFrame>, gate: watch::Receiver<CaptureGate>) -> Self {
        Self { tx, gate }
    }

    /// Stamp and queue one frame. Returns `false` if it was dropped.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let epoch = self.gate.borrow().epoch;
        self.tx.try_send(CapturedFrame { epoch, samples }).is_ok()
    }
}

/// A microphone that streams mono f32 frames.
#[async_trait]
pub trait CaptureDevice: Send + Sync + 'static {
    /// Acquire the device and start streaming frames into `frames`.
    ///
    /// Resolves once the stream is running (after any permission prompt).
    /// Streaming continues until `cancel` fires, at which point the device
    /// is released. Frames may be any length; the capture pipeline re-frames
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Device`](crate::SessionError::Device) if the
    /// device is missing or access is denied.
    async fn start(&self, frames: FrameSink, cancel: CancellationToken) -> Result<()>;
}

/// A speaker that plays one contiguous buffer at a time.
pub trait AudioSink: Send + 'static {
    /// Begin playing `samples`. The returned receiver resolves when the
    /// buffer has drained or was halted.
    ///
    /// # Errors
    ///
    /// Returns an error if output cannot be started.
    fn play(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<oneshot::Receiver<()>>;

    /// Stop in-flight output immediately.
    fn halt(&mut self);
}
