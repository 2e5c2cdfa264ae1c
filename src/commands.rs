//! Backend-pushed tool commands and their delivery to the host.
//!
//! The backend asks the host application to do things (change route, update
//! the chart, open a panel) by sending `tool_command` messages. Each one is
//! decoded into a [`ToolCommand`] and handed to the single registered
//! [`CommandSubscriber`]. A bad command is logged and skipped; it never stops
//! the session from processing the next message.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::CommandError;

/// Tool names this client understands.
pub const KNOWN_COMMANDS: &[&str] = &["navigate", "set_chart_state", "show_panel"];

/// A decoded tool command.
///
/// Serialises to the same `{tool_name, tool_args}` shape the backend sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool_name", content = "tool_args", rename_all = "snake_case")]
pub enum ToolCommand {
    /// Move the host application to another route.
    Navigate {
        #[serde(alias = "path")]
        route: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// Update the chart view. Everything except `chart_type` is passed through.
    SetChartState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chart_type: Option<String>,
        #[serde(flatten)]
        options: Map<String, Value>,
    },
    /// Open a side panel, optionally with content.
    ShowPanel {
        panel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl ToolCommand {
    /// Decode a `tool_command` payload.
    ///
    /// `args` may be a JSON object, a string containing a JSON object, or
    /// null (no arguments).
    ///
    /// # Errors
    ///
    /// [`CommandError::Unknown`] for names outside [`KNOWN_COMMANDS`],
    /// [`CommandError::MalformedArgs`] when the arguments do not fit.
    pub fn decode(name: &str, args: &Value) -> Result<Self, CommandError> {
        if !KNOWN_COMMANDS.contains(&name) {
            return Err(CommandError::Unknown(name.to_owned()));
        }
        let malformed = |reason: String| CommandError::MalformedArgs {
            name: name.to_owned(),
            reason,
        };

        let args = match args {
            Value::Null => Value::Object(Map::new()),
            Value::String(raw) if raw.trim().is_empty() => Value::Object(Map::new()),
            Value::String(raw) => serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?,
            other => other.clone(),
        };
        if !args.is_object() {
            return Err(malformed("arguments must be an object".into()));
        }

        let envelope = serde_json::json!({ "tool_name": name, "tool_args": args });
        serde_json::from_value(envelope).map_err(|e| malformed(e.to_string()))
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::SetChartState { .. } => "set_chart_state",
            Self::ShowPanel { .. } => "show_panel",
        }
    }
}

/// Receives decoded tool commands. Registered once per session.
pub trait CommandSubscriber: Send + 'static {
    fn on_command(&mut self, command: ToolCommand);
}

impl<F> CommandSubscriber for F
where
    F: FnMut(ToolCommand) + Send + 'static,
{
    fn on_command(&mut self, command: ToolCommand) {
        self(command);
    }
}

/// Forwards commands into an mpsc channel.
///
/// Commands are dropped (and logged) when the receiver is full or gone; the
/// session never waits on the host.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<ToolCommand>,
}

impl ChannelSubscriber {
    /// A subscriber and the receiving end, with room for `capacity` commands.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ToolCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl CommandSubscriber for ChannelSubscriber {
    fn on_command(&mut self, command: ToolCommand) {
        let name = command.name();
        if let Err(e) = self.tx.try_send(command) {
            warn!(command = name, "tool command not delivered: {e}");
        }
    }
}

/// What happened to one `tool_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Unknown,
    Malformed,
    /// No subscriber is registered.
    Unhandled,
    /// The subscriber panicked; the panic was contained.
    Panicked,
}

/// Decodes tool commands and delivers them to the subscriber.
#[derive(Default)]
pub struct CommandDispatcher {
    subscriber: Option<Box<dyn CommandSubscriber>>,
}

impl CommandDispatcher {
    pub fn new(subscriber: impl CommandSubscriber) -> Self {
        Self {
            subscriber: Some(Box::new(subscriber)),
        }
    }

    /// Replace the subscriber. Later commands go to the new one.
    pub fn set_subscriber(&mut self, subscriber: Box<dyn CommandSubscriber>) {
        self.subscriber = Some(subscriber);
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_some()
    }

    /// Decode and deliver one command.
    pub fn dispatch(&mut self, name: &str, args: &Value) -> DispatchOutcome {
        let command = match ToolCommand::decode(name, args) {
            Ok(command) => command,
            Err(CommandError::Unknown(name)) => {
                warn!(command = %name, "ignoring unknown tool command");
                return DispatchOutcome::Unknown;
            }
            Err(e) => {
                warn!("skipping tool command: {e}");
                return DispatchOutcome::Malformed;
            }
        };

        let Some(subscriber) = self.subscriber.as_mut() else {
            debug!(command = command.name(), "no command subscriber registered");
            return DispatchOutcome::Unhandled;
        };

        let name = command.name();
        match catch_unwind(AssertUnwindSafe(|| subscriber.on_command(command))) {
            Ok(()) => {
                debug!(command = name, "tool command delivered");
                DispatchOutcome::Delivered
            }
            Err(_) => {
                error!(command = name, "command subscriber panicked");
                DispatchOutcome::Panicked
            }
        }
    }
}
