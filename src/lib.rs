//! voicelink: real-time voice session client.
//!
//! This crate keeps a persistent, bidirectional audio link between the local
//! device and a conversational backend:
//! Microphone → framing → PCM16/base64 → WebSocket → backend → audio chunks →
//! pre-buffered playback → Speaker
//!
//! # Architecture
//!
//! Independent tasks connected by bounded channels:
//! - **Transport**: reconnecting WebSocket link with capability probe and
//!   keepalive pings (`tokio-tungstenite`)
//! - **Capture**: microphone frames re-framed into fixed-size blocks (`cpal`)
//! - **Playback**: jitter pre-buffering and batched output (`cpal`)
//! - **Session**: a single actor that owns all state and gates audio on it
//! - **Commands**: typed tool commands routed to one host subscriber

pub mod audio;
pub mod capture;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod host;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;

#[doc(hidden)]
pub mod test_utils;

pub use commands::{ChannelSubscriber, CommandDispatcher, CommandSubscriber, ToolCommand};
pub use config::VoiceLinkConfig;
pub use error::{CodecError, CommandError, ConnectError, Result, SessionError};
pub use session::{
    ConnectionStatus, SessionDevices, SessionEvent, SessionSnapshot, VoiceSession, VoiceState,
};
