//! Configuration types for the voice session client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::VoiceSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceLinkConfig {
    /// Backend link and reconnect policy.
    pub transport: TransportConfig,
    /// Microphone/speaker settings.
    pub audio: AudioConfig,
    /// Playback pre-buffering and batching.
    pub playback: PlaybackConfig,
    /// Conversation/session behaviour.
    pub session: SessionConfig,
}

/// Backend link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket URL of the voice backend.
    pub server_url: String,
    /// HTTP endpoint answering `{"available": bool}`. `None` skips the probe.
    pub probe_url: Option<String>,
    /// First reconnect delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the reconnect delay in milliseconds.
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Liveness ping interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Timeout for the capability probe request in milliseconds.
    pub probe_timeout_ms: u64,
    /// Messages that may wait for the socket writer before sends are dropped.
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000/ws/voice".to_owned(),
            probe_url: None,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            ping_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            outbound_capacity: 64,
        }
    }
}

impl TransportConfig {
    /// Ping interval as a `Duration`.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz (wire format for outbound audio).
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz (wire format for inbound audio).
    pub output_sample_rate: u32,
    /// Samples per outbound capture block.
    pub capture_block_size: usize,
    /// Capture blocks buffered between the framer and the session.
    pub capture_queue_capacity: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            capture_block_size: 4_096,
            capture_queue_capacity: 8,
            input_device: None,
            output_device: None,
        }
    }
}

/// Playback scheduler configuration.
///
/// The defaults trade roughly 100 ms of latency for jitter absorption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Chunks that must be queued before playback starts immediately.
    pub min_buffered_chunks: usize,
    /// Delay before starting with fewer than `min_buffered_chunks`.
    pub recheck_delay_ms: u64,
    /// Maximum chunks concatenated into one output buffer.
    pub max_batch_chunks: usize,
    /// Fixed output attenuation.
    pub output_gain: f32,
    /// Capacity of the chunk hand-off channel.
    pub queue_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_buffered_chunks: 4,
            recheck_delay_ms: 100,
            max_batch_chunks: 5,
            output_gain: 0.7,
            queue_capacity: 64,
        }
    }
}

impl PlaybackConfig {
    /// Re-check delay as a `Duration`.
    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }
}

/// Session behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed between end of user turn and the first response audio.
    pub processing_timeout_ms: u64,
    /// Voice settings sent with `start_session`.
    pub voice: VoiceSettings,
    /// Backend error codes/messages that are transient and not shown to the user.
    ///
    /// Matched case-insensitively as substrings.
    pub benign_error_patterns: Vec<String>,
    /// Capacity of the host command channel.
    pub command_capacity: usize,
    /// Capacity of the session event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            processing_timeout_ms: 10_000,
            voice: VoiceSettings::default(),
            benign_error_patterns: vec!["indexing".to_owned(), "INDEX_NOT_READY".to_owned()],
            command_capacity: 32,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Whether a backend error matches one of the benign patterns, either in
    /// its message or its code.
    pub fn is_benign_error(&self, error: &str, code: Option<&str>) -> bool {
        let error = error.to_lowercase();
        let code = code.map(str::to_lowercase);
        self.benign_error_patterns.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            !pattern.is_empty()
                && (error.contains(&pattern)
                    || code.as_deref().is_some_and(|c| c.contains(&pattern)))
        })
    }

    /// Processing watchdog as a `Duration`.
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

impl VoiceLinkConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SessionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/voicelink/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("voicelink").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("voicelink")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/voicelink-config/config.toml")
        }
    }
}
