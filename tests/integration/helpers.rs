//! Shared helpers for integration tests.
//!
//! [`FakeBackend`] is a local WebSocket server that records every client
//! message, answers the session handshake, and lets a test push messages or
//! drop the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use voicelink::commands::ToolCommand;
use voicelink::config::VoiceLinkConfig;
use voicelink::session::{SessionDevices, SessionSnapshot, VoiceSession};
use voicelink::test_utils::{RecordingSink, ScriptedCapture};
use voicelink::transport::{ProbeOutcome, StaticProbe};
use voicelink::{ChannelSubscriber, CommandSubscriber};

/// Upper bound for anything a test waits on.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

enum Control {
    Send(String),
    Drop,
}

/// Local stand-in for the voice backend.
pub(crate) struct FakeBackend {
    url: String,
    control: mpsc::UnboundedSender<Control>,
    received: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
}

impl FakeBackend {
    /// Start a backend that answers `connected` on open and
    /// `session_started` to every `start_session`.
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let control_rx = Arc::new(Mutex::new(control_rx));
        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let control = Arc::clone(&control_rx);
                let received = received_tx.clone();
                tokio::spawn(async move {
                    let mut control = control.lock().await;
                    serve_connection(ws, n, &mut control, &received).await;
                });
            }
        });

        Self {
            url: format!("ws://{addr}/ws/voice"),
            control: control_tx,
            received: received_rx,
            connections,
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Number of sockets accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Push a message to the connected client.
    pub(crate) fn send(&self, message: Value) {
        let _ = self.control.send(Control::Send(message.to_string()));
    }

    /// Push an `audio_chunk` of `samples` samples at half scale.
    pub(crate) fn send_audio(&self, samples: usize) {
        let data = voicelink::codec::encode_samples(&vec![0.5; samples]);
        self.send(json!({"type": "audio_chunk", "data": data}));
    }

    /// Drop the current connection without a close frame.
    pub(crate) fn drop_connection(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Next message from the client, skipping pings.
    pub(crate) async fn next(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.received.recv())
                .await
                .expect("timed out waiting for client message")
                .expect("fake backend stopped");
            if message["type"] != "ping" {
                return message;
            }
        }
    }

    /// Wait for the next client message of type `kind`, skipping others.
    pub(crate) async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let message = self.next().await;
            if message["type"] == kind {
                return message;
            }
        }
    }

    /// Wait for any message of type `kind`, including pings.
    pub(crate) async fn expect_raw(&mut self, kind: &str) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.received.recv())
                .await
                .expect("timed out waiting for client message")
                .expect("fake backend stopped");
            if message["type"] == kind {
                return message;
            }
        }
    }

    /// Everything received so far that has not been consumed.
    pub(crate) fn drain(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(message) = self.received.try_recv() {
            messages.push(message);
        }
        messages
    }
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    n: usize,
    control: &mut mpsc::UnboundedReceiver<Control>,
    received: &mpsc::UnboundedSender<Value>,
) {
    let (mut write, mut read) = ws.split();
    let hello = json!({"type": "connected", "session_id": format!("sess-{n}")});
    if write.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = read.next() => {
                let Some(Ok(Message::Text(text))) = frame else { return };
                let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                if value["type"] == "start_session" {
                    let started = json!({"type": "session_started", "voice_name": "aria"});
                    let _ = write.send(Message::Text(started.to_string())).await;
                }
                let _ = received.send(value);
            }
            control = control.recv() => match control {
                Some(Control::Send(text)) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(Control::Drop) | None => return,
            },
        }
    }
}

/// A `ws://` URL with nothing listening on it.
pub(crate) async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}/ws/voice")
}

/// Config pointed at `url`, with fast reconnects.
pub(crate) fn test_config(url: &str) -> VoiceLinkConfig {
    let mut config = VoiceLinkConfig::default();
    config.transport.server_url = url.to_owned();
    config.transport.initial_delay_ms = 10;
    config.transport.max_delay_ms = 50;
    config.audio.capture_block_size = 64;
    config
}

/// A session with scripted devices and a tool-command channel.
pub(crate) struct TestSession {
    pub session: VoiceSession,
    pub mic: ScriptedCapture,
    pub speaker: RecordingSink,
    pub tools: mpsc::Receiver<ToolCommand>,
}

pub(crate) fn spawn_session(config: VoiceLinkConfig, probe: ProbeOutcome) -> TestSession {
    spawn_session_with_mic(config, probe, ScriptedCapture::new())
}

pub(crate) fn spawn_session_with_mic(
    config: VoiceLinkConfig,
    probe: ProbeOutcome,
    mic: ScriptedCapture,
) -> TestSession {
    let speaker = RecordingSink::new();
    let (subscriber, tools) = ChannelSubscriber::channel(8);
    let commands: Box<dyn CommandSubscriber> = Box::new(subscriber);
    let devices = SessionDevices {
        capture: Arc::new(mic.clone()),
        sink: speaker.clone(),
        probe: Arc::new(StaticProbe(probe)),
        commands: Some(commands),
    };
    let (session, _task) = VoiceSession::spawn(config, devices);
    TestSession {
        session,
        mic,
        speaker,
        tools,
    }
}

/// Wait until the published snapshot satisfies `pred`.
pub(crate) async fn wait_for(
    rx: &mut watch::Receiver<SessionSnapshot>,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let result = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for session state");
    result.expect("session actor stopped").clone()
}

/// Poll `cond` until it holds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
