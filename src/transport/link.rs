//! Reconnecting WebSocket link to the voice backend.
//!
//! [`Transport`] owns a single logical duplex connection. A background tokio
//! task probes the backend, opens the socket, pumps messages both ways, sends
//! keepalive pings, and reconnects with exponential backoff on unexpected
//! closure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::policy::ReconnectPolicy;
use super::probe::{CapabilityProbe, ProbeOutcome};
use crate::config::TransportConfig;
use crate::error::ConnectError;
use crate::protocol::{ClientMessage, ServerMessage};

/// Capacity of the link -> session event channel.
pub const LINK_EVENT_CAPACITY: usize = 256;

/// Events reported by the link task, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// An open attempt is starting (`attempt` failures so far).
    Connecting { attempt: u32 },
    /// The socket is open and the attempt counter was reset.
    Open,
    /// A decoded backend message.
    Message(ServerMessage),
    /// The link dropped. `retry_in` is `None` when no retry will follow.
    /// `attempt` is the reconnect count at the time of the drop.
    Closed {
        reason: String,
        retry_in: Option<Duration>,
        attempt: u32,
    },
    /// All reconnect attempts failed.
    Exhausted { attempts: u32 },
    /// The capability probe reported the backend unavailable. No socket was opened.
    NoCredentials,
}

/// Handle to the reconnecting link.
///
/// Every successful [`connect`](Self::connect) hands out a fresh event
/// receiver, so events from a closed link can never leak into the next one.
pub struct Transport {
    config: TransportConfig,
    probe: Arc<dyn CapabilityProbe>,
    policy: Arc<Mutex<ReconnectPolicy>>,
    outbound: Option<mpsc::Sender<ClientMessage>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Transport {
    /// Create an idle transport.
    pub fn new(config: TransportConfig, probe: Arc<dyn CapabilityProbe>) -> Self {
        let policy = Arc::new(Mutex::new(ReconnectPolicy::from_config(&config)));
        Self {
            config,
            probe,
            policy,
            outbound: None,
            cancel: None,
            task: None,
        }
    }

    /// Whether a link task is currently running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the link. Idempotent while a link task is running.
    ///
    /// The capability probe and socket open happen in the background; their
    /// outcome arrives as [`LinkEvent`]s on the returned receiver, in order.
    /// Returns `None` if a link task was already running (its receiver stays
    /// valid).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::InvalidUrl`] if the server URL cannot be parsed.
    pub fn connect(&mut self) -> Result<Option<mpsc::Receiver<LinkEvent>>, ConnectError> {
        if self.is_running() {
            debug!("connect() while link is running; ignoring");
            return Ok(None);
        }

        url::Url::parse(&self.config.server_url)
            .map_err(|e| ConnectError::InvalidUrl(format!("{}: {e}", self.config.server_url)))?;

        lock_policy(&self.policy).rearm();

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let (events, events_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let ctx = LinkContext {
            url: self.config.server_url.clone(),
            ping_interval: self.config.ping_interval(),
            probe: Arc::clone(&self.probe),
            policy: Arc::clone(&self.policy),
            events,
            cancel: cancel.clone(),
        };

        self.task = Some(tokio::spawn(async move {
            connection_loop(ctx, rx).await;
        }));
        self.outbound = Some(tx);
        self.cancel = Some(cancel);
        Ok(Some(events_rx))
    }

    /// Queue a message for the open link without waiting.
    ///
    /// The queue is bounded; when the socket stalls, new messages are
    /// dropped instead of piling up.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Closed`] if no link task is running and
    /// [`ConnectError::QueueFull`] if the message was dropped for lack of room.
    pub fn send(&self, message: ClientMessage) -> Result<(), ConnectError> {
        let tx = self.outbound.as_ref().ok_or(ConnectError::Closed)?;
        trace!(kind = message.kind(), "queue outbound message");
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(message) => {
                debug!(kind = message.kind(), "outbound queue full; message dropped");
                ConnectError::QueueFull
            }
            TrySendError::Closed(_) => ConnectError::Closed,
        })
    }

    /// Caller-initiated close.
    ///
    /// Reconnects are disabled before the task is cancelled, so a pending
    /// backoff timer can never reopen the link. Queued messages are flushed
    /// if the socket is open.
    pub fn close(&mut self) {
        lock_policy(&self.policy).disable();
        self.outbound = None;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.task = None;
    }

    /// Snapshot of the reconnect policy, for diagnostics.
    pub fn policy(&self) -> ReconnectPolicy {
        lock_policy(&self.policy).clone()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_policy(policy: &Mutex<ReconnectPolicy>) -> std::sync::MutexGuard<'_, ReconnectPolicy> {
    match policy.lock() {
        Ok(p) => p,
        Err(p) => p.into_inner(),
    }
}

struct LinkContext {
    url: String,
    ping_interval: Duration,
    probe: Arc<dyn CapabilityProbe>,
    policy: Arc<Mutex<ReconnectPolicy>>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
}

impl LinkContext {
    /// Deliver an event to the session. Nothing is delivered after `close()`.
    async fn emit(&self, event: LinkEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.events.send(event).await.is_err() {
            trace!("link event receiver dropped");
        }
    }
}

/// How a single connection attempt ended.
enum AttemptEnd {
    /// Caller closed the link.
    Closed,
    /// Backend has no credentials; do not retry.
    NoCredentials,
    /// Unexpected failure or closure.
    Failed(String),
}

/// Run the link with automatic reconnection until closed or exhausted.
async fn connection_loop(
    ctx: LinkContext,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
) {
    loop {
        let attempt = lock_policy(&ctx.policy).attempts();
        ctx.emit(LinkEvent::Connecting { attempt }).await;

        let end = try_connect(&ctx, &mut outbound_rx).await;

        let reason = match end {
            AttemptEnd::Closed => {
                info!("link closed by caller");
                return;
            }
            AttemptEnd::NoCredentials => {
                warn!("backend reported unavailable; not opening link");
                ctx.emit(LinkEvent::NoCredentials).await;
                return;
            }
            AttemptEnd::Failed(reason) => reason,
        };

        let (delay, attempts, should_reconnect) = {
            let mut policy = lock_policy(&ctx.policy);
            let delay = policy.next_delay();
            (delay, policy.attempts(), policy.should_reconnect())
        };

        match delay {
            Some(delay) => {
                warn!(attempt = attempts, ?delay, "link failed: {reason}; reconnecting");
                ctx.emit(LinkEvent::Closed {
                    reason,
                    retry_in: Some(delay),
                    attempt: attempts,
                })
                .await;
                tokio::select! {
                    () = ctx.cancel.cancelled() => {
                        debug!("reconnect cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            None if should_reconnect => {
                warn!(attempts, "link failed: {reason}; reconnect attempts exhausted");
                ctx.emit(LinkEvent::Closed {
                    reason,
                    retry_in: None,
                    attempt: attempts,
                })
                .await;
                ctx.emit(LinkEvent::Exhausted { attempts }).await;
                return;
            }
            None => {
                ctx.emit(LinkEvent::Closed {
                    reason,
                    retry_in: None,
                    attempt: attempts,
                })
                .await;
                return;
            }
        }
    }
}

/// One probe + open + pump cycle.
async fn try_connect(
    ctx: &LinkContext,
    outbound_rx: &mut mpsc::Receiver<ClientMessage>,
) -> AttemptEnd {
    let outcome = tokio::select! {
        () = ctx.cancel.cancelled() => return AttemptEnd::Closed,
        outcome = ctx.probe.probe() => outcome,
    };
    match outcome {
        Ok(ProbeOutcome::Available) => {}
        Ok(ProbeOutcome::Unavailable) => return AttemptEnd::NoCredentials,
        Err(e) => return AttemptEnd::Failed(e.to_string()),
    }

    let opened = tokio::select! {
        () = ctx.cancel.cancelled() => return AttemptEnd::Closed,
        opened = connect_async(ctx.url.as_str()) => opened,
    };
    let ws_stream = match opened {
        Ok((stream, _)) => stream,
        Err(e) => return AttemptEnd::Failed(format!("connect: {e}")),
    };
    let (mut write, mut read) = ws_stream.split();

    // Anything queued while the link was down is stale.
    let mut stale = 0usize;
    while outbound_rx.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        debug!(stale, "discarded messages queued while disconnected");
    }

    lock_policy(&ctx.policy).reset();
    info!(url = %ctx.url, "link open");
    ctx.emit(LinkEvent::Open).await;

    let mut ping_interval = tokio::time::interval(ctx.ping_interval);
    // Skip the first immediate tick.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                        Ok(message) => {
                            trace!(kind = message.kind(), "inbound message");
                            ctx.emit(LinkEvent::Message(message)).await;
                        }
                        Err(e) => debug!("ignoring unparseable backend message: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return AttemptEnd::Failed("connection closed by server".into());
                    }
                    Some(Err(e)) => return AttemptEnd::Failed(format!("read error: {e}")),
                    _ => {} // Binary, Ping/Pong frames handled by tungstenite.
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    let _ = write.close().await;
                    return AttemptEnd::Closed;
                };
                if let Err(e) = send_json(&mut write, &message).await {
                    return AttemptEnd::Failed(format!("send error: {e}"));
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = send_json(&mut write, &ClientMessage::Ping).await {
                    return AttemptEnd::Failed(format!("ping error: {e}"));
                }
            }
            () = ctx.cancel.cancelled() => {
                while let Ok(message) = outbound_rx.try_recv() {
                    if send_json(&mut write, &message).await.is_err() {
                        break;
                    }
                }
                let _ = write.close().await;
                return AttemptEnd::Closed;
            }
        }
    }
}

async fn send_json<S>(write: &mut S, message: &ClientMessage) -> Result<(), String>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message).map_err(|e| format!("serialize: {e}"))?;
    write.send(Message::Text(json)).await.map_err(|e| e.to_string())
}
