//! Newline-delimited JSON bridge between a host process and a [`VoiceSession`].
//!
//! Reads `CommandEnvelope` lines from the input, runs each against the
//! session, and writes `ResponseEnvelope` lines to the output. Session events
//! and tool commands are written as `EventEnvelope` lines as they happen.
//!
//! When the output is stdout, it is reserved for the JSON protocol; all
//! diagnostic output (tracing, logs) must go to stderr.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{error, info, warn};

use crate::commands::ToolCommand;
use crate::error::{Result, SessionError};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use crate::protocol::HistoryEntry;
use crate::session::VoiceSession;

type SharedWriter<W> = Arc<Mutex<W>>;

#[derive(Deserialize)]
struct SendTextPayload {
    text: String,
}

#[derive(Deserialize)]
struct SyncHistoryPayload {
    history: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct SetContextPayload {
    #[serde(default)]
    context: Option<serde_json::Value>,
}

/// Run the bridge on process stdin/stdout until stdin closes or
/// `session.shutdown` is received.
///
/// # Errors
///
/// Returns an error if stdout cannot be written.
pub async fn run_stdio_bridge(
    session: VoiceSession,
    tool_commands: mpsc::Receiver<ToolCommand>,
) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::BufWriter::new(tokio::io::stdout());
    run_bridge(session, tool_commands, stdin, stdout).await
}

/// Run the bridge over arbitrary I/O.
///
/// Two activities run concurrently: the reader (this task) executes
/// commands in order, and a forwarder task writes session events and tool
/// commands. Both share the writer, one line at a time.
///
/// # Errors
///
/// Returns an error if the input cannot be read or the output written.
pub async fn run_bridge<R, W>(
    session: VoiceSession,
    tool_commands: mpsc::Receiver<ToolCommand>,
    input: R,
    output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(output));
    let event_ids = Arc::new(AtomicU64::new(1));

    let forwarder = tokio::spawn(forward_events(
        session.subscribe(),
        tool_commands,
        Arc::clone(&writer),
        Arc::clone(&event_ids),
    ));

    let result = run_reader(&session, input, &writer).await;

    if let Err(e) = session.shutdown().await {
        // Already stopped by `session.shutdown`.
        tracing::debug!("session shutdown after bridge exit: {e}");
    }
    forwarder.abort();
    let _ = forwarder.await;
    result
}

async fn forward_events<W>(
    mut events: broadcast::Receiver<crate::session::SessionEvent>,
    mut tool_commands: mpsc::Receiver<ToolCommand>,
    writer: SharedWriter<W>,
    event_ids: Arc<AtomicU64>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut tools_open = true;
    loop {
        let envelope = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => EventEnvelope::from_session(event_ids.fetch_add(1, Ordering::Relaxed), &event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event forwarder lagged; some events were dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("session event channel closed; stopping event forwarder");
                    break;
                }
            },
            command = tool_commands.recv(), if tools_open => match command {
                Some(command) => EventEnvelope::from_tool_command(event_ids.fetch_add(1, Ordering::Relaxed), &command),
                None => {
                    tools_open = false;
                    continue;
                }
            },
        };

        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize event envelope; skipping");
                continue;
            }
        };
        let mut w = writer.lock().await;
        if let Err(e) = write_line(&mut *w, &json).await {
            warn!(error = %e, "failed to write event envelope; stopping event forwarder");
            break;
        }
    }
}

async fn run_reader<R, W>(session: &VoiceSession, mut input: R, writer: &SharedWriter<W>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = input
            .read_line(&mut line)
            .await
            .map_err(|e| SessionError::Channel(format!("failed to read command: {e}")))?;
        if bytes_read == 0 {
            info!("input closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                send_response(writer, &response).await?;
                continue;
            }
        };

        let is_shutdown = envelope.command == CommandName::SessionShutdown;
        let response = match execute(session, &envelope).await {
            Ok(payload) => ResponseEnvelope::ok(envelope.request_id.clone(), payload),
            Err(e) => {
                warn!(command = envelope.command.as_str(), "command failed: {e}");
                ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
            }
        };
        send_response(writer, &response).await?;

        if is_shutdown {
            info!("session.shutdown received; stopping bridge");
            break;
        }
    }
    Ok(())
}

/// Run one command against the session.
async fn execute(session: &VoiceSession, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
    envelope
        .validate()
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    let bad_payload = |e: crate::host::contract::ContractError| SessionError::Protocol(e.to_string());

    match envelope.command {
        CommandName::SessionConnect => session.connect().await?,
        CommandName::SessionDisconnect => session.disconnect().await?,
        CommandName::SessionSnapshot => {
            return serde_json::to_value(session.snapshot())
                .map_err(|e| SessionError::Protocol(e.to_string()));
        }
        CommandName::SessionShutdown => session.shutdown().await?,
        CommandName::ListenStart => session.start_listening().await?,
        CommandName::ListenStop => session.stop_listening().await?,
        CommandName::ConversationSendText => {
            let payload: SendTextPayload = envelope.payload_as().map_err(bad_payload)?;
            session.send_text(payload.text).await?;
        }
        CommandName::ConversationSetContext => {
            let payload: SetContextPayload = envelope.payload_as().map_err(bad_payload)?;
            session.set_context(payload.context).await?;
        }
        CommandName::HistorySync => {
            let payload: SyncHistoryPayload = envelope.payload_as().map_err(bad_payload)?;
            session.sync_history(payload.history).await?;
        }
        CommandName::HistoryClear => session.clear_history().await?,
        CommandName::PlaybackStop => session.stop_playback().await?,
    }
    Ok(serde_json::json!({}))
}

async fn send_response<W>(writer: &SharedWriter<W>, response: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)
        .map_err(|e| SessionError::Protocol(format!("failed to serialize response: {e}")))?;
    let mut w = writer.lock().await;
    write_line(&mut *w, &json).await
}

/// Write a single JSON line and flush.
async fn write_line<W>(writer: &mut W, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| SessionError::Channel(format!("failed to write output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| SessionError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| SessionError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}
