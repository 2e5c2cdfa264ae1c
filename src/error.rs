//! Error types for the voice session client.

/// Failure to convert between wire payloads and audio samples.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The transport text was not valid base64.
    #[error("malformed base64 payload: {0}")]
    Base64(String),

    /// PCM16 payloads must contain an even number of bytes.
    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),
}

/// Failure to establish the duplex link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The capability probe reported that the backend cannot serve a session.
    #[error("backend unavailable (no credentials)")]
    Unavailable,

    /// The capability probe itself failed.
    #[error("capability probe failed: {0}")]
    Probe(String),

    /// The configured server URL is not a valid URL.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// Every reconnect attempt failed.
    #[error("gave up after {0} reconnect attempts")]
    Exhausted(u32),

    /// The transport was shut down.
    #[error("transport closed")]
    Closed,

    /// The outbound queue was full and the message was dropped.
    #[error("outbound queue full")]
    QueueFull,
}

/// A `tool_command` that could not be turned into a [`ToolCommand`](crate::commands::ToolCommand).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown tool command '{0}'")]
    Unknown(String),

    #[error("malformed arguments for '{name}': {reason}")]
    MalformedArgs { name: String, reason: String },
}

/// Top-level error type for the voice session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Could not connect to the backend.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Microphone or speaker device error.
    #[error("audio device error: {0}")]
    Device(String),

    /// Sample codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An operation needed an open link.
    #[error("not connected")]
    NotConnected,

    /// Malformed message from the backend.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested voice-state transition is not allowed.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
