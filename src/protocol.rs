//! Wire protocol between the client and the voice backend.
//!
//! Both directions are JSON objects discriminated by a `type` field.

use serde::{Deserialize, Serialize};

/// Voice settings sent with `start_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Backend voice identifier.
    pub voice_name: String,
    /// BCP-47 language hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Relative speaking rate (1.0 = normal).
    pub speaking_rate: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice_name: "default".to_owned(),
            language: None,
            speaking_rate: 1.0,
        }
    }
}

/// One prior conversation turn, for `sync_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    /// `"voice"` or `"text"`, depending on how the turn was entered.
    pub mode: String,
}

/// Messages sent from client to backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        voice_settings: VoiceSettings,
        session_id: Option<String>,
        astrological_context: Option<serde_json::Value>,
    },
    AudioChunk {
        data: String,
    },
    EndTurn,
    TextMessage {
        content: String,
    },
    SyncHistory {
        history: Vec<HistoryEntry>,
    },
    ClearHistory,
    StopSession,
    Ping,
}

impl ClientMessage {
    /// Short name for logging, without payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "start_session",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::EndTurn => "end_turn",
            Self::TextMessage { .. } => "text_message",
            Self::SyncHistory { .. } => "sync_history",
            Self::ClearHistory => "clear_history",
            Self::StopSession => "stop_session",
            Self::Ping => "ping",
        }
    }
}

/// Messages received from the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(default)]
        session_id: Option<String>,
    },
    SessionStarted {
        #[serde(default)]
        voice_name: Option<String>,
    },
    AudioChunk {
        data: String,
    },
    TextDelta {
        #[serde(default)]
        content: String,
    },
    Transcript {
        #[serde(default)]
        role: String,
        #[serde(default)]
        text: String,
    },
    TurnComplete {},
    SessionStopped {},
    HistorySynced {},
    ToolCommand {
        tool_name: String,
        #[serde(default)]
        tool_args: serde_json::Value,
    },
    Error {
        #[serde(default)]
        error: String,
        #[serde(default)]
        code: Option<String>,
    },
    Pong {},
}

impl ServerMessage {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error for unknown types or missing fields.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short name for logging, without payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SessionStarted { .. } => "session_started",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::TextDelta { .. } => "text_delta",
            Self::Transcript { .. } => "transcript",
            Self::TurnComplete {} => "turn_complete",
            Self::SessionStopped {} => "session_stopped",
            Self::HistorySynced {} => "history_synced",
            Self::ToolCommand { .. } => "tool_command",
            Self::Error { .. } => "error",
            Self::Pong {} => "pong",
        }
    }
}
