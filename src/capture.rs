//! Capture pipeline: microphone frames -> fixed-size blocks -> wire payloads.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::audio::{CaptureDevice, CaptureGate, CapturedFrame, FrameSink};
use crate::codec::encode_samples;
use crate::config::AudioConfig;
use crate::error::Result;

/// Raw frames buffered between the device callback and the framer.
const FRAME_QUEUE_CAPACITY: usize = 32;

/// One fixed-size block of input samples.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBlock {
    pub samples: Vec<f32>,
}

impl CaptureBlock {
    /// PCM16 + base64, ready for an `audio_chunk` message.
    pub fn encode(&self) -> String {
        encode_samples(&self.samples)
    }
}

/// An encoded block on its way to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    /// base64 PCM16 payload.
    pub data: String,
    /// Sample count before encoding.
    pub samples: usize,
    /// Gate epoch every sample in the block was captured under.
    pub epoch: u64,
}

/// Re-frames arbitrary device buffers into fixed-size blocks.
#[derive(Debug)]
pub struct BlockFramer {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockFramer {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Append a frame and return every block it completes.
    pub fn push(&mut self, frame: &[f32]) -> Vec<CaptureBlock> {
        let mut blocks = Vec::new();
        let mut rest = frame;
        while !rest.is_empty() {
            let room = self.block_size - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.block_size {
                let samples =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                blocks.push(CaptureBlock { samples });
            }
        }
        blocks
    }

    /// Samples held back waiting for a full block.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial block.
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

/// An acquired microphone feeding encoded blocks to the session.
///
/// Dropping or [`stop`](Self::stop)ping releases the device; partial blocks
/// are discarded, never flushed.
pub struct CaptureSession {
    cancel: CancellationToken,
}

impl CaptureSession {
    /// Acquire `device` and start framing.
    ///
    /// Frames are stamped with the `gate` epoch as they are captured, and a
    /// block never mixes samples from two epochs: a partial block is
    /// discarded as soon as a frame from a newer epoch arrives. Encoded
    /// blocks go to `blocks` with `try_send`; when the session is behind,
    /// blocks are dropped rather than queued.
    ///
    /// # Errors
    ///
    /// Propagates the device error if acquisition fails.
    pub async fn start(
        device: Arc<dyn CaptureDevice>,
        config: &AudioConfig,
        gate: watch::Receiver<CaptureGate>,
        blocks: mpsc::Sender<EncodedBlock>,
    ) -> Result<Self> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let epoch = gate.borrow().epoch;

        if let Err(e) = device
            .start(FrameSink::new(frames_tx, gate), cancel.clone())
            .await
        {
            cancel.cancel();
            return Err(e);
        }

        info!(
            block_size = config.capture_block_size,
            sample_rate = config.input_sample_rate,
            "microphone acquired"
        );

        let framer = BlockFramer::new(config.capture_block_size);
        tokio::spawn(run_framer(framer, epoch, frames_rx, blocks, cancel.clone()));
        Ok(Self { cancel })
    }

    /// Release the device.
    pub fn stop(self) {
        self.cancel.cancel();
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_framer(
    mut framer: BlockFramer,
    mut epoch: u64,
    mut frames: mpsc::Receiver<CapturedFrame>,
    blocks: mpsc::Sender<EncodedBlock>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if frame.epoch != epoch {
                    if framer.pending() > 0 {
                        trace!(discarded = framer.pending(), "gate changed; dropping partial block");
                    }
                    framer.discard();
                    epoch = frame.epoch;
                }
                for block in framer.push(&frame.samples) {
                    let encoded = EncodedBlock {
                        data: block.encode(),
                        samples: block.samples.len(),
                        epoch,
                    };
                    if blocks.try_send(encoded).is_err() {
                        trace!("capture block dropped: session busy");
                    }
                }
            }
        }
    }
    debug!(discarded = framer.pending(), "capture framing stopped");
    framer.discard();
}
