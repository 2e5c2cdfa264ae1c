//! Session state: connection status, turn state, transcript.

use serde::Serialize;

use crate::error::{Result, SessionError};

/// Link status as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted, or the server URL is invalid.
    Error,
    /// The capability probe said the backend cannot serve a session.
    NoCredentials,
}

impl ConnectionStatus {
    /// Whether audio may flow in either direction.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Conversational turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl VoiceState {
    pub const ALL: [Self; 4] = [Self::Idle, Self::Listening, Self::Processing, Self::Speaking];

    /// Whether `self -> to` is a permitted edge.
    ///
    /// `Speaking` is entered only from `Processing`; `Listening` only from
    /// `Idle` or `Speaking`. Every state may return to `Idle`.
    pub fn can_transition_to(self, to: Self) -> bool {
        use VoiceState::*;
        matches!(
            (self, to),
            (Idle, Listening)
                | (Idle, Processing)
                | (Listening, Processing)
                | (Processing, Speaking)
                | (Speaking, Listening)
                | (_, Idle)
        ) && self != to
    }
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionStats {
    /// Capture blocks sent to the backend.
    pub blocks_sent: u64,
    /// Capture blocks dropped at the gate.
    pub blocks_dropped: u64,
    /// Audio chunks received from the backend.
    pub chunks_received: u64,
}

/// Mutable session state, owned by the session actor.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub connection_status: ConnectionStatus,
    voice_state: VoiceState,
    /// Assistant text for the current turn. Cleared on turn completion.
    pub transcript: String,
    /// Last user-visible backend error.
    pub last_error: Option<String>,
    /// The `start_session` handshake completed on the current link.
    pub session_active: bool,
    /// The microphone is held.
    pub capture_active: bool,
    pub stats: SessionStats,
}

impl SessionState {
    pub fn voice_state(&self) -> VoiceState {
        self.voice_state
    }

    /// Move to `to`.
    ///
    /// Returns `Ok(false)` if already there.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidTransition`] for edges the state machine does
    /// not allow; the state is left unchanged.
    pub fn transition(&mut self, to: VoiceState) -> Result<bool> {
        let from = self.voice_state;
        if from == to {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            return Err(SessionError::InvalidTransition(format!("{from:?} -> {to:?}")));
        }
        self.voice_state = to;
        Ok(true)
    }

    /// Forget everything tied to the current connection.
    pub fn reset(&mut self) {
        self.voice_state = VoiceState::Idle;
        self.session_id = None;
        self.transcript.clear();
        self.last_error = None;
        self.session_active = false;
        self.capture_active = false;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            connection_status: self.connection_status,
            voice_state: self.voice_state,
            transcript: self.transcript.clone(),
            last_error: self.last_error.clone(),
            session_active: self.session_active,
            capture_active: self.capture_active,
            stats: self.stats,
        }
    }
}

/// Read-only view of [`SessionState`] published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub connection_status: ConnectionStatus,
    pub voice_state: VoiceState,
    pub transcript: String,
    pub last_error: Option<String>,
    pub session_active: bool,
    pub capture_active: bool,
    pub stats: SessionStats,
}
