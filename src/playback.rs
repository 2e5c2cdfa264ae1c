//! Playback scheduler: pre-buffering, batching, and cancellation of
//! assistant audio.
//!
//! Incoming chunks queue up until either enough have arrived to ride out
//! network jitter or a short re-check delay expires. Playback then runs as a
//! chain of batches, each several chunks concatenated into one buffer so the
//! output device sees fewer seams.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::audio::AudioSink;
use crate::codec::apply_gain;
use crate::config::PlaybackConfig;
use crate::error::{Result, SessionError};

/// A decoded block of assistant audio, consumed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Normalized mono samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// What the scheduler should do after a chunk arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// Enough audio is buffered: start the playback loop now.
    Start,
    /// Start a re-check timer; play whatever is queued when it fires.
    ArmRecheck,
    /// Nothing to do (already playing or a start is pending).
    Wait,
}

/// Ordered queue of chunks awaiting playback.
///
/// `playing` is set while a batch chain is running. `armed` is set from the
/// first trigger (buffer threshold or re-check) until the queue drains, so
/// concurrent arrivals can never start a second loop.
#[derive(Debug)]
pub struct PlaybackQueue {
    chunks: VecDeque<AudioChunk>,
    playing: bool,
    armed: bool,
    min_buffered: usize,
    max_batch: usize,
    gain: f32,
}

impl PlaybackQueue {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            chunks: VecDeque::new(),
            playing: false,
            armed: false,
            min_buffered: config.min_buffered_chunks.max(1),
            max_batch: config.max_batch_chunks.max(1),
            gain: config.output_gain,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Append a chunk in arrival order.
    pub fn push(&mut self, chunk: AudioChunk) -> QueueAction {
        self.chunks.push_back(chunk);
        if self.playing {
            return QueueAction::Wait;
        }
        if self.chunks.len() >= self.min_buffered {
            self.playing = true;
            self.armed = true;
            return QueueAction::Start;
        }
        if self.armed {
            return QueueAction::Wait;
        }
        self.armed = true;
        QueueAction::ArmRecheck
    }

    /// The re-check delay elapsed. Returns `true` if playback should start.
    pub fn recheck(&mut self) -> bool {
        if self.playing {
            return false;
        }
        if self.chunks.is_empty() {
            self.armed = false;
            return false;
        }
        self.playing = true;
        true
    }

    /// Dequeue up to `max_batch` chunks as one attenuated buffer.
    ///
    /// Returns `None` and clears both flags once the queue is empty.
    pub fn next_batch(&mut self) -> Option<Vec<f32>> {
        if self.chunks.is_empty() {
            self.playing = false;
            self.armed = false;
            return None;
        }
        let take = self.chunks.len().min(self.max_batch);
        let total: usize = self.chunks.iter().take(take).map(|c| c.samples.len()).sum();
        let mut buffer = Vec::with_capacity(total);
        for chunk in self.chunks.drain(..take) {
            buffer.extend_from_slice(&chunk.samples);
        }
        apply_gain(&mut buffer, self.gain);
        Some(buffer)
    }

    /// Drop everything and reset both flags. Returns the number of chunks dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.chunks.len();
        self.chunks.clear();
        self.playing = false;
        self.armed = false;
        dropped
    }
}

/// Playback progress reported to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The first batch of a run began.
    Started,
    /// The queue ran dry after playing.
    Drained,
    /// Playback was cancelled; `dropped` chunks were discarded.
    Stopped { dropped: usize },
}

enum PlaybackCommand {
    Chunk(AudioChunk),
    Stop,
}

/// Handle to the playback task.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::Sender<PlaybackCommand>,
}

impl PlaybackHandle {
    /// Queue a chunk. Order across calls is preserved.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the playback task has exited.
    pub async fn enqueue(&self, chunk: AudioChunk) -> Result<()> {
        self.tx
            .send(PlaybackCommand::Chunk(chunk))
            .await
            .map_err(|_| SessionError::Channel("playback task closed".into()))
    }

    /// Halt in-flight output and clear the queue. Chunks enqueued before this
    /// call are discarded; later ones start a fresh run.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the playback task has exited.
    pub async fn stop(&self) -> Result<()> {
        self.tx
            .send(PlaybackCommand::Stop)
            .await
            .map_err(|_| SessionError::Channel("playback task closed".into()))
    }
}

/// Spawn the single playback task for a session.
///
/// The task exits when `cancel` fires or every handle is dropped.
pub fn spawn_playback<S: AudioSink>(
    sink: S,
    config: PlaybackConfig,
    sample_rate: u32,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    cancel: CancellationToken,
) -> (PlaybackHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let task = tokio::spawn(async move {
        PlaybackLoop {
            queue: PlaybackQueue::new(&config),
            config,
            sink,
            sample_rate,
            events,
            recheck_at: None,
            in_flight: None,
        }
        .run(rx, cancel)
        .await;
    });
    (PlaybackHandle { tx }, task)
}

struct PlaybackLoop<S> {
    queue: PlaybackQueue,
    config: PlaybackConfig,
    sink: S,
    sample_rate: u32,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    recheck_at: Option<Instant>,
    in_flight: Option<oneshot::Receiver<()>>,
}

impl<S: AudioSink> PlaybackLoop<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<PlaybackCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(PlaybackCommand::Chunk(chunk)) => self.on_chunk(chunk),
                    Some(PlaybackCommand::Stop) => self.stop(),
                    None => break,
                },
                () = sleep_until_opt(self.recheck_at) => {
                    self.recheck_at = None;
                    if self.queue.recheck() {
                        debug!(queued = self.queue.len(), "re-check elapsed; starting playback");
                        self.emit(PlaybackEvent::Started);
                        self.play_next();
                    }
                }
                () = wait_in_flight(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.play_next();
                }
            }
        }
        self.sink.halt();
        self.queue.clear();
        debug!("playback task exited");
    }

    fn on_chunk(&mut self, chunk: AudioChunk) {
        match self.queue.push(chunk) {
            QueueAction::Start => {
                self.recheck_at = None;
                debug!(queued = self.queue.len(), "buffer threshold reached; starting playback");
                self.emit(PlaybackEvent::Started);
                self.play_next();
            }
            QueueAction::ArmRecheck => {
                self.recheck_at = Some(Instant::now() + self.config.recheck_delay());
            }
            QueueAction::Wait => {}
        }
    }

    /// Start the next batch, or report the drain.
    fn play_next(&mut self) {
        while let Some(buffer) = self.queue.next_batch() {
            trace!(samples = buffer.len(), "playing batch");
            match self.sink.play(buffer, self.sample_rate) {
                Ok(done) => {
                    self.in_flight = Some(done);
                    return;
                }
                Err(e) => error!("failed to play batch: {e}"),
            }
        }
        self.in_flight = None;
        self.emit(PlaybackEvent::Drained);
    }

    fn stop(&mut self) {
        self.sink.halt();
        self.in_flight = None;
        self.recheck_at = None;
        let dropped = self.queue.clear();
        info!(dropped, "playback stopped");
        self.emit(PlaybackEvent::Stopped { dropped });
    }

    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn wait_in_flight(in_flight: &mut Option<oneshot::Receiver<()>>) {
    match in_flight {
        Some(done) => {
            let _ = done.await;
        }
        None => std::future::pending().await,
    }
}
