//! Voice session: the state machine that drives transport, capture, and playback.

pub mod actor;
pub mod state;
pub mod watchdog;

pub use actor::{SessionDevices, SessionEvent, VoiceSession};
pub use state::{ConnectionStatus, SessionSnapshot, SessionState, SessionStats, VoiceState};
pub use watchdog::ProcessingWatchdog;
