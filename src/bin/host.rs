//! Headless voice session host for stdin/stdout JSON communication.
//!
//! Reads `CommandEnvelope` messages as newline-delimited JSON from stdin,
//! runs them against a voice session on the system microphone and speakers,
//! and writes `ResponseEnvelope` and `EventEnvelope` messages to stdout.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.
//!
//! Usage: `voicelink-host [CONFIG_PATH]`. Without a path, the default config
//! file is used if present.

use std::path::PathBuf;

use anyhow::Context;
use voicelink::host::stdio::run_stdio_bridge;
use voicelink::{ChannelSubscriber, VoiceLinkConfig, VoiceSession};

/// Tool commands buffered for the host before new ones are dropped.
const TOOL_COMMAND_CAPACITY: usize = 32;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voicelink=info")),
        )
        .init();

    let config = load_config(std::env::args_os().nth(1).map(PathBuf::from))?;
    tracing::info!(server = %config.transport.server_url, "voicelink-host starting");

    let (subscriber, tool_commands) = ChannelSubscriber::channel(TOOL_COMMAND_CAPACITY);
    let (session, actor) = VoiceSession::with_system_audio(config, Some(Box::new(subscriber)))
        .context("failed to start voice session")?;

    run_stdio_bridge(session, tool_commands)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "voicelink-host exited with error");
            anyhow::anyhow!("voicelink-host failed: {e}")
        })?;

    let _ = actor.await;
    tracing::info!("voicelink-host shut down cleanly");
    Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<VoiceLinkConfig> {
    if let Some(path) = explicit {
        return VoiceLinkConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    let path = VoiceLinkConfig::default_config_path();
    if path.exists() {
        tracing::info!(path = %path.display(), "loading config");
        return VoiceLinkConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    Ok(VoiceLinkConfig::default())
}
