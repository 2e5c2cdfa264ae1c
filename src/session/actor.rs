//! The session actor and its host-facing handle.
//!
//! One tokio task owns [`SessionState`] and is the only thing that mutates
//! it. Host calls, link events, capture blocks, playback progress, and the
//! processing watchdog all arrive at that task and are handled one at a time,
//! in arrival order. Observers read state through a `watch` snapshot and a
//! `broadcast` event stream.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::state::{ConnectionStatus, SessionSnapshot, SessionState, VoiceState};
use super::watchdog::ProcessingWatchdog;
use crate::audio::{AudioSink, CaptureDevice, CaptureGate, CpalCapture, CpalPlayback};
use crate::capture::{CaptureSession, EncodedBlock};
use crate::codec::decode_samples;
use crate::commands::{CommandDispatcher, CommandSubscriber};
use crate::config::{AudioConfig, SessionConfig, VoiceLinkConfig};
use crate::error::{ConnectError, Result, SessionError};
use crate::playback::{AudioChunk, PlaybackEvent, PlaybackHandle, spawn_playback};
use crate::protocol::{ClientMessage, HistoryEntry, ServerMessage};
use crate::transport::{
    CapabilityProbe, HttpCapabilityProbe, LinkEvent, ProbeOutcome, StaticProbe, Transport,
};

/// Notifications for the host, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        status: ConnectionStatus,
    },
    VoiceStateChanged {
        from: VoiceState,
        to: VoiceState,
    },
    /// The backend acknowledged `start_session`.
    SessionStarted {
        session_id: Option<String>,
        voice_name: Option<String>,
    },
    TranscriptDelta {
        content: String,
    },
    Transcript {
        role: String,
        text: String,
    },
    /// A turn finished; `transcript` is the assistant text it produced.
    TurnComplete {
        transcript: String,
    },
    HistorySynced,
    /// A non-benign backend error.
    BackendError {
        message: String,
        code: Option<String>,
    },
    /// The processing watchdog reset the turn.
    ProcessingTimeout,
    /// The link dropped and will be retried.
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    PlaybackStarted,
    PlaybackDrained,
    PlaybackStopped {
        dropped: usize,
    },
}

/// Collaborators the session drives.
pub struct SessionDevices<S> {
    pub capture: Arc<dyn CaptureDevice>,
    pub sink: S,
    pub probe: Arc<dyn CapabilityProbe>,
    pub commands: Option<Box<dyn CommandSubscriber>>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionCommand {
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    StartListening(Reply<()>),
    StopListening(Reply<()>),
    SendText(String, Reply<()>),
    SyncHistory(Vec<HistoryEntry>, Reply<()>),
    ClearHistory(Reply<()>),
    StopPlayback(Reply<()>),
    SetContext(Option<serde_json::Value>, Reply<()>),
    Shutdown(Reply<()>),
}

/// Results of work the actor spawned off its own task.
enum Internal {
    CaptureReady {
        generation: u64,
        result: Result<CaptureSession>,
    },
}

/// A `start_listening` call waiting on the handshake or the microphone.
struct PendingListen {
    reply: Reply<()>,
    /// Set once acquisition was started; `None` while waiting for `session_started`.
    generation: Option<u64>,
}

/// Cloneable handle to a running voice session.
#[derive(Clone)]
pub struct VoiceSession {
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl VoiceSession {
    /// Spawn the session actor and its playback task.
    pub fn spawn<S: AudioSink>(
        config: VoiceLinkConfig,
        devices: SessionDevices<S>,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.session.command_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));
        let (capture_tx, capture_rx) = mpsc::channel(config.audio.capture_queue_capacity.max(1));
        let (gate, _) = watch::channel(CaptureGate::default());
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (playback_events_tx, playback_events_rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();
        let (playback, _playback_task) = spawn_playback(
            devices.sink,
            config.playback.clone(),
            config.audio.output_sample_rate,
            playback_events_tx,
            cancel.child_token(),
        );

        let mut dispatcher = CommandDispatcher::default();
        if let Some(subscriber) = devices.commands {
            dispatcher.set_subscriber(subscriber);
        }

        let actor = SessionActor {
            watchdog: ProcessingWatchdog::new(config.session.processing_timeout()),
            transport: Transport::new(config.transport.clone(), devices.probe),
            session: config.session,
            audio: config.audio,
            state: SessionState::default(),
            link_rx: None,
            capture_device: devices.capture,
            capture: None,
            capture_tx,
            gate,
            internal_tx,
            playback,
            dispatcher,
            snapshot_tx,
            events: events.clone(),
            pending_connect: Vec::new(),
            pending_listen: None,
            listen_generation: 0,
            start_sent: false,
            context: None,
            cancel,
        };
        let task = tokio::spawn(actor.run(command_rx, capture_rx, internal_rx, playback_events_rx));

        (
            Self {
                commands: command_tx,
                snapshot: snapshot_rx,
                events,
            },
            task,
        )
    }

    /// Spawn a session on the system microphone and speakers.
    ///
    /// Uses an HTTP capability probe when `transport.probe_url` is set and
    /// assumes the backend is available otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe client cannot be built.
    pub fn with_system_audio(
        config: VoiceLinkConfig,
        commands: Option<Box<dyn CommandSubscriber>>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let probe: Arc<dyn CapabilityProbe> = match &config.transport.probe_url {
            Some(url) => Arc::new(HttpCapabilityProbe::new(
                url.clone(),
                config.transport.probe_timeout(),
            )?),
            None => Arc::new(StaticProbe(ProbeOutcome::Available)),
        };
        let devices = SessionDevices {
            capture: Arc::new(CpalCapture::new(&config.audio)),
            sink: CpalPlayback::new(&config.audio),
            probe,
            commands,
        };
        Ok(Self::spawn(config, devices))
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Channel("session actor stopped".into()))?;
        rx.await
            .map_err(|_| SessionError::Channel("session actor dropped the request".into()))?
    }

    /// Open the link. Resolves once it is open or has definitively failed.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Unavailable`] when the backend has no credentials,
    /// [`ConnectError::Exhausted`] when every attempt failed.
    pub async fn connect(&self) -> Result<()> {
        self.request(SessionCommand::Connect).await
    }

    /// Close the link and reset the session. Safe in any state.
    ///
    /// # Errors
    ///
    /// Only fails if the actor has stopped.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(SessionCommand::Disconnect).await
    }

    /// Start a user turn: handshake if needed, then acquire the microphone.
    ///
    /// Called while the assistant is still processing or speaking, the
    /// microphone is acquired now and the session moves to `Listening` when
    /// the turn completes.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without an open link,
    /// [`SessionError::Device`] if the microphone cannot be acquired.
    pub async fn start_listening(&self) -> Result<()> {
        self.request(SessionCommand::StartListening).await
    }

    /// Release the microphone and end the user turn. Safe in any state.
    ///
    /// # Errors
    ///
    /// Only fails if the actor has stopped.
    pub async fn stop_listening(&self) -> Result<()> {
        self.request(SessionCommand::StopListening).await
    }

    /// Send a typed user message.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without an open link.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendText(text, reply)).await
    }

    /// Replace the backend's conversation history.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without an open link.
    pub async fn sync_history(&self, entries: Vec<HistoryEntry>) -> Result<()> {
        self.request(|reply| SessionCommand::SyncHistory(entries, reply))
            .await
    }

    /// Clear the backend's conversation history and the local transcript.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without an open link.
    pub async fn clear_history(&self) -> Result<()> {
        self.request(SessionCommand::ClearHistory).await
    }

    /// Interrupt the assistant: halt output and drop queued audio.
    ///
    /// # Errors
    ///
    /// Only fails if the actor has stopped.
    pub async fn stop_playback(&self) -> Result<()> {
        self.request(SessionCommand::StopPlayback).await
    }

    /// Context sent with the next `start_session`.
    ///
    /// # Errors
    ///
    /// Only fails if the actor has stopped.
    pub async fn set_context(&self, context: Option<serde_json::Value>) -> Result<()> {
        self.request(|reply| SessionCommand::SetContext(context, reply))
            .await
    }

    /// Disconnect and stop the actor.
    ///
    /// # Errors
    ///
    /// Fails if the actor had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(SessionCommand::Shutdown).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified on every state change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

struct SessionActor {
    session: SessionConfig,
    audio: AudioConfig,
    state: SessionState,
    transport: Transport,
    link_rx: Option<mpsc::Receiver<LinkEvent>>,
    capture_device: Arc<dyn CaptureDevice>,
    capture: Option<CaptureSession>,
    capture_tx: mpsc::Sender<EncodedBlock>,
    /// Opens only while Connected and Listening; capture stamps frames with it.
    gate: watch::Sender<CaptureGate>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    playback: PlaybackHandle,
    watchdog: ProcessingWatchdog,
    dispatcher: CommandDispatcher,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    pending_connect: Vec<Reply<()>>,
    pending_listen: Option<PendingListen>,
    listen_generation: u64,
    /// `start_session` went out on the current link and is unanswered.
    start_sent: bool,
    context: Option<serde_json::Value>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut capture_rx: mpsc::Receiver<EncodedBlock>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        info!("voice session started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Shutdown(reply)) => {
                        self.teardown().await;
                        self.respond(reply, Ok(()));
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                event = recv_link(&mut self.link_rx) => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => self.link_rx = None,
                },
                Some(block) = capture_rx.recv() => self.on_capture_block(block),
                Some(internal) = internal_rx.recv() => self.on_internal(internal),
                Some(event) = playback_rx.recv() => self.on_playback_event(event),
                () = self.watchdog.expired() => self.on_processing_timeout(),
            }
            self.publish();
        }
        self.publish();
        self.cancel.cancel();
        info!("voice session stopped");
    }

    // ── host commands ───────────────────────────────────────────────

    async fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect(reply) => self.connect(reply),
            SessionCommand::Disconnect(reply) => {
                self.disconnect().await;
                self.respond(reply, Ok(()));
            }
            SessionCommand::StartListening(reply) => self.start_listening(reply),
            SessionCommand::StopListening(reply) => {
                self.stop_listening();
                self.respond(reply, Ok(()));
            }
            SessionCommand::SendText(text, reply) => {
                let result = self.send_text(text);
                self.respond(reply, result);
            }
            SessionCommand::SyncHistory(history, reply) => {
                let result = self.send_connected(ClientMessage::SyncHistory { history });
                self.respond(reply, result);
            }
            SessionCommand::ClearHistory(reply) => {
                let result = self.send_connected(ClientMessage::ClearHistory);
                if result.is_ok() {
                    self.state.transcript.clear();
                }
                self.respond(reply, result);
            }
            SessionCommand::StopPlayback(reply) => {
                let result = self.playback.stop().await;
                self.respond(reply, result);
            }
            SessionCommand::SetContext(context, reply) => {
                self.context = context;
                self.respond(reply, Ok(()));
            }
            SessionCommand::Shutdown(reply) => {
                self.respond(reply, Ok(()));
            }
        }
    }

    fn connect(&mut self, reply: Reply<()>) {
        match self.state.connection_status {
            ConnectionStatus::Connected => {
                self.respond(reply, Ok(()));
                return;
            }
            ConnectionStatus::Connecting => {
                self.pending_connect.push(reply);
                return;
            }
            _ => {}
        }

        match self.transport.connect() {
            Ok(rx) => {
                if let Some(rx) = rx {
                    self.link_rx = Some(rx);
                }
                self.set_status(ConnectionStatus::Connecting);
                self.pending_connect.push(reply);
            }
            Err(e) => {
                warn!("cannot connect: {e}");
                self.set_status(ConnectionStatus::Error);
                self.respond(reply, Err(e.into()));
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.state.session_active || self.start_sent {
            let _ = self.transport.send(ClientMessage::StopSession);
        }
        self.transport.close();
        self.link_rx = None;
        self.release_turn().await;
        self.state.reset();
        self.start_sent = false;
        self.set_status(ConnectionStatus::Disconnected);
        self.fail_pending_connect(|| ConnectError::Closed.into());
        info!("disconnected");
    }

    async fn teardown(&mut self) {
        self.disconnect().await;
        self.cancel.cancel();
    }

    fn start_listening(&mut self, reply: Reply<()>) {
        if !self.state.connection_status.is_connected() {
            self.respond(reply, Err(SessionError::NotConnected));
            return;
        }
        if self.capture.is_some() {
            self.respond(reply, Ok(()));
            return;
        }
        if self.pending_listen.is_some() {
            self.respond(reply, Err(SessionError::InvalidTransition(
                "start_listening already in progress".into(),
            )));
            return;
        }

        if self.state.session_active {
            let generation = self.acquire_capture();
            self.pending_listen = Some(PendingListen {
                reply,
                generation: Some(generation),
            });
            return;
        }

        if let Err(e) = self.send_start_session() {
            self.respond(reply, Err(e));
            return;
        }
        self.pending_listen = Some(PendingListen {
            reply,
            generation: None,
        });
    }

    fn stop_listening(&mut self) {
        if let Some(pending) = self.pending_listen.take() {
            self.listen_generation += 1;
            self.respond(pending.reply, Err(SessionError::InvalidTransition(
                "listening cancelled".into(),
            )));
        }
        self.release_capture();

        if self.state.voice_state() == VoiceState::Listening {
            self.set_voice(VoiceState::Processing);
            if let Err(e) = self.transport.send(ClientMessage::EndTurn) {
                debug!("end_turn not sent: {e}");
            }
            self.watchdog.arm();
        }
    }

    fn send_text(&mut self, content: String) -> Result<()> {
        if !self.state.connection_status.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if !self.state.session_active {
            self.send_start_session()?;
        }
        self.send_connected(ClientMessage::TextMessage { content })?;
        if self.state.voice_state() == VoiceState::Idle {
            self.set_voice(VoiceState::Processing);
            self.watchdog.arm();
        }
        Ok(())
    }

    fn send_connected(&mut self, message: ClientMessage) -> Result<()> {
        if !self.state.connection_status.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.transport.send(message)?;
        Ok(())
    }

    fn send_start_session(&mut self) -> Result<()> {
        if self.start_sent {
            return Ok(());
        }
        self.send_connected(ClientMessage::StartSession {
            voice_settings: self.session.voice.clone(),
            session_id: self.state.session_id.clone(),
            astrological_context: self.context.clone(),
        })?;
        self.start_sent = true;
        Ok(())
    }

    /// Acquire the microphone off the actor task. The result comes back as
    /// [`Internal::CaptureReady`] tagged with the returned generation.
    fn acquire_capture(&mut self) -> u64 {
        self.listen_generation += 1;
        let generation = self.listen_generation;
        let device = Arc::clone(&self.capture_device);
        let audio = self.audio.clone();
        let blocks = self.capture_tx.clone();
        let gate = self.gate.subscribe();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = CaptureSession::start(device, &audio, gate, blocks).await;
            // A send failure drops the capture, releasing the device.
            let _ = internal.send(Internal::CaptureReady { generation, result });
        });
        generation
    }

    fn release_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
            info!("microphone released");
        }
        self.state.capture_active = false;
    }

    /// Drop everything tied to the current turn and go idle.
    async fn release_turn(&mut self) {
        if let Some(pending) = self.pending_listen.take() {
            self.respond(pending.reply, Err(SessionError::NotConnected));
        }
        self.listen_generation += 1;
        self.release_capture();
        self.watchdog.disarm();
        if let Err(e) = self.playback.stop().await {
            debug!("playback stop skipped: {e}");
        }
        self.set_voice(VoiceState::Idle);
    }

    // ── link events ─────────────────────────────────────────────────

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connecting { attempt } => {
                debug!(attempt, "link connecting");
                self.set_status(ConnectionStatus::Connecting);
            }
            LinkEvent::Open => {
                self.set_status(ConnectionStatus::Connected);
                self.publish();
                for reply in self.pending_connect.drain(..) {
                    let _ = reply.send(Ok(()));
                }
            }
            LinkEvent::Message(message) => self.on_message(message).await,
            LinkEvent::Closed {
                reason,
                retry_in,
                attempt,
            } => {
                if self.state.connection_status == ConnectionStatus::Connected {
                    warn!("link lost: {reason}");
                    self.release_turn().await;
                    self.state.session_active = false;
                    self.start_sent = false;
                    self.set_status(ConnectionStatus::Disconnected);
                }
                if let Some(delay) = retry_in {
                    self.emit(SessionEvent::Reconnecting {
                        attempt,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            LinkEvent::Exhausted { attempts } => {
                self.set_status(ConnectionStatus::Error);
                self.state.last_error = Some(format!("connection lost after {attempts} attempts"));
                self.fail_pending_connect(|| ConnectError::Exhausted(attempts).into());
            }
            LinkEvent::NoCredentials => {
                self.set_status(ConnectionStatus::NoCredentials);
                self.fail_pending_connect(|| ConnectError::Unavailable.into());
            }
        }
    }

    async fn on_message(&mut self, message: ServerMessage) {
        trace!(kind = message.kind(), "backend message");
        match message {
            ServerMessage::Connected { session_id } => {
                if session_id.is_some() {
                    self.state.session_id = session_id;
                }
            }
            ServerMessage::SessionStarted { voice_name } => {
                info!(?voice_name, "session started");
                self.state.session_active = true;
                self.start_sent = false;
                self.emit(SessionEvent::SessionStarted {
                    session_id: self.state.session_id.clone(),
                    voice_name,
                });
                let awaiting = self
                    .pending_listen
                    .as_ref()
                    .is_some_and(|p| p.generation.is_none());
                if awaiting {
                    let generation = self.acquire_capture();
                    if let Some(pending) = self.pending_listen.as_mut() {
                        pending.generation = Some(generation);
                    }
                }
            }
            ServerMessage::AudioChunk { data } => self.on_audio_chunk(&data).await,
            ServerMessage::TextDelta { content } => {
                self.state.transcript.push_str(&content);
                self.emit(SessionEvent::TranscriptDelta { content });
            }
            ServerMessage::Transcript { role, text } => {
                self.emit(SessionEvent::Transcript { role, text });
            }
            ServerMessage::TurnComplete {} => self.on_turn_complete(),
            ServerMessage::SessionStopped {} => {
                info!("backend stopped the session");
                self.release_turn().await;
                self.state.session_active = false;
                self.start_sent = false;
            }
            ServerMessage::HistorySynced {} => self.emit(SessionEvent::HistorySynced),
            ServerMessage::ToolCommand {
                tool_name,
                tool_args,
            } => {
                self.dispatcher.dispatch(&tool_name, &tool_args);
            }
            ServerMessage::Error { error, code } => self.on_backend_error(error, code),
            ServerMessage::Pong {} => {}
        }
    }

    async fn on_audio_chunk(&mut self, data: &str) {
        if !self.state.connection_status.is_connected() {
            return;
        }
        let samples = match decode_samples(data) {
            Ok(samples) => samples,
            Err(e) => {
                debug!("dropping undecodable audio chunk: {e}");
                return;
            }
        };
        self.state.stats.chunks_received += 1;

        if self.state.voice_state() == VoiceState::Processing {
            self.watchdog.disarm();
            self.set_voice(VoiceState::Speaking);
        }

        let chunk = AudioChunk {
            samples,
            sample_rate: self.audio.output_sample_rate,
        };
        if let Err(e) = self.playback.enqueue(chunk).await {
            warn!("audio chunk not queued: {e}");
        }
    }

    fn on_turn_complete(&mut self) {
        self.watchdog.disarm();
        let transcript = std::mem::take(&mut self.state.transcript);
        let mic_active = self.capture.is_some();
        match self.state.voice_state() {
            VoiceState::Speaking => {
                let next = if mic_active {
                    VoiceState::Listening
                } else {
                    VoiceState::Idle
                };
                self.set_voice(next);
            }
            VoiceState::Processing => {
                self.set_voice(VoiceState::Idle);
                if mic_active {
                    self.set_voice(VoiceState::Listening);
                }
            }
            VoiceState::Listening | VoiceState::Idle => {}
        }
        self.emit(SessionEvent::TurnComplete { transcript });
    }

    fn on_backend_error(&mut self, error: String, code: Option<String>) {
        if self.session.is_benign_error(&error, code.as_deref()) {
            debug!(?code, "suppressed transient backend error: {error}");
            return;
        }
        warn!(?code, "backend error: {error}");
        self.state.last_error = Some(error.clone());
        self.emit(SessionEvent::BackendError {
            message: error,
            code,
        });
    }

    // ── capture, playback, timers ───────────────────────────────────

    fn on_capture_block(&mut self, block: EncodedBlock) {
        let gate = *self.gate.borrow();
        let open = gate.open
            && block.epoch == gate.epoch
            && self.state.connection_status.is_connected()
            && self.state.voice_state() == VoiceState::Listening;
        if !open {
            self.state.stats.blocks_dropped += 1;
            trace!(
                samples = block.samples,
                epoch = block.epoch,
                current = gate.epoch,
                "capture block dropped at gate"
            );
            return;
        }
        match self.transport.send(ClientMessage::AudioChunk { data: block.data }) {
            Ok(()) => self.state.stats.blocks_sent += 1,
            Err(e) => {
                self.state.stats.blocks_dropped += 1;
                debug!("capture block not sent: {e}");
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::CaptureReady { generation, result } => {
                self.on_capture_ready(generation, result);
            }
        }
    }

    fn on_capture_ready(&mut self, generation: u64, result: Result<CaptureSession>) {
        let current = self
            .pending_listen
            .as_ref()
            .is_some_and(|p| p.generation == Some(generation));
        if !current {
            // Stale acquisition; dropping it releases the device.
            debug!(generation, "discarding stale microphone acquisition");
            return;
        }
        let Some(pending) = self.pending_listen.take() else {
            return;
        };

        let capture = match result {
            Ok(capture) => capture,
            Err(e) => {
                warn!("microphone unavailable: {e}");
                self.respond(pending.reply, Err(e));
                return;
            }
        };
        if !self.state.connection_status.is_connected() {
            self.respond(pending.reply, Err(SessionError::NotConnected));
            return;
        }

        self.capture = Some(capture);
        self.state.capture_active = true;
        if self.state.voice_state() == VoiceState::Idle {
            self.set_voice(VoiceState::Listening);
        }
        self.respond(pending.reply, Ok(()));
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        self.emit(match event {
            PlaybackEvent::Started => SessionEvent::PlaybackStarted,
            PlaybackEvent::Drained => SessionEvent::PlaybackDrained,
            PlaybackEvent::Stopped { dropped } => SessionEvent::PlaybackStopped { dropped },
        });
    }

    fn on_processing_timeout(&mut self) {
        self.watchdog.disarm();
        if self.state.voice_state() != VoiceState::Processing {
            return;
        }
        warn!(
            timeout_ms = self.session.processing_timeout_ms,
            "no response from backend; resetting turn"
        );
        self.set_voice(VoiceState::Idle);
        self.emit(SessionEvent::ProcessingTimeout);
        if self.capture.is_some() {
            self.set_voice(VoiceState::Listening);
        }
    }

    // ── state plumbing ──────────────────────────────────────────────

    fn set_voice(&mut self, to: VoiceState) {
        let from = self.state.voice_state();
        match self.state.transition(to) {
            Ok(true) => {
                debug!(?from, ?to, "voice state");
                self.emit(SessionEvent::VoiceStateChanged { from, to });
            }
            Ok(false) => {}
            Err(e) => warn!("refused voice transition: {e}"),
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.state.connection_status == status {
            return;
        }
        info!(?status, "connection status");
        self.state.connection_status = status;
        self.emit(SessionEvent::StatusChanged { status });
    }

    fn fail_pending_connect(&mut self, error: impl Fn() -> SessionError) {
        self.publish();
        for reply in self.pending_connect.drain(..) {
            let _ = reply.send(Err(error()));
        }
    }

    /// Publish the current state, then answer the caller, so a caller that
    /// reads the snapshot after an awaited call sees its effect.
    fn respond<T>(&self, reply: Reply<T>, result: Result<T>) {
        self.publish();
        let _ = reply.send(result);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Sync the capture gate with the current state, then publish the
    /// snapshot. The gate moves first so an observer that sees `Listening`
    /// never races a still-closed gate.
    fn publish(&self) {
        let open = self.state.connection_status.is_connected()
            && self.state.voice_state() == VoiceState::Listening;
        self.gate.send_if_modified(|gate| {
            let next = gate.with_open(open);
            if next == *gate {
                false
            } else {
                trace!(open, epoch = next.epoch, "capture gate");
                *gate = next;
                true
            }
        });

        let snapshot = self.state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn recv_link(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
