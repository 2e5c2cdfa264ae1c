//! Versioned command/event envelopes for host integrations.

use serde::{Deserialize, Serialize};

use crate::commands::ToolCommand;
use crate::session::SessionEvent;

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Commands a host may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "session.connect")]
    SessionConnect,
    #[serde(rename = "session.disconnect")]
    SessionDisconnect,
    #[serde(rename = "session.snapshot")]
    SessionSnapshot,
    #[serde(rename = "session.shutdown")]
    SessionShutdown,
    #[serde(rename = "listen.start")]
    ListenStart,
    #[serde(rename = "listen.stop")]
    ListenStop,
    #[serde(rename = "conversation.send_text")]
    ConversationSendText,
    #[serde(rename = "conversation.set_context")]
    ConversationSetContext,
    #[serde(rename = "history.sync")]
    HistorySync,
    #[serde(rename = "history.clear")]
    HistoryClear,
    #[serde(rename = "playback.stop")]
    PlaybackStop,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionConnect => "session.connect",
            Self::SessionDisconnect => "session.disconnect",
            Self::SessionSnapshot => "session.snapshot",
            Self::SessionShutdown => "session.shutdown",
            Self::ListenStart => "listen.start",
            Self::ListenStop => "listen.stop",
            Self::ConversationSendText => "conversation.send_text",
            Self::ConversationSetContext => "conversation.set_context",
            Self::HistorySync => "history.sync",
            Self::HistoryClear => "history.clear",
            Self::PlaybackStop => "playback.stop",
        }
    }
}

/// A versioned command envelope from host -> session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::UnsupportedVersion {
                got: self.v,
                expected: EVENT_VERSION,
            });
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::InvalidEnvelope(
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Decode the payload into the shape `command` expects.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ContractError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ContractError::InvalidEnvelope(format!(
                "bad payload for {}: {e}",
                self.command.as_str()
            ))
        })
    }
}

/// A versioned response envelope from session -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A versioned event envelope from session -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }

    /// Wrap a session event. The `event` field is `session.<kind>`.
    #[must_use]
    pub fn from_session(event_id: u64, event: &SessionEvent) -> Self {
        let mut payload = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        let kind = payload
            .as_object_mut()
            .and_then(|map| map.remove("event"))
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_owned());
        Self::new(event_id.to_string(), format!("session.{kind}"), payload)
    }

    /// Wrap a tool command. The `event` field is `tool.<name>`.
    #[must_use]
    pub fn from_tool_command(event_id: u64, command: &ToolCommand) -> Self {
        let payload = serde_json::to_value(command)
            .ok()
            .and_then(|mut v| v.get_mut("tool_args").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null);
        Self::new(
            event_id.to_string(),
            format!("tool.{}", command.name()),
            payload,
        )
    }
}

/// Envelope validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("unsupported contract version {got}; expected {expected}")]
    UnsupportedVersion { got: u32, expected: u32 },
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}
