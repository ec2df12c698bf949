//! Messages carried by the bus.
//!
//! The bus itself treats messages as opaque payloads; interpretation is the
//! receiver's responsibility. [`Message`] is a tagged union checked at the
//! boundary instead of runtime type inspection: commands, state snapshots,
//! progress events, completed patches, and store handles each get their own
//! variant.

use std::str::FromStr;
use std::sync::Arc;

use crate::bus::Topic;
use crate::error::ProtocolError;
use crate::store::{Patch, PatchReader, Side, TaskState};

/// A command drawn from the closed enumeration of the control protocol.
///
/// External callers produce these from strings via [`Command::from_str`];
/// unknown strings are rejected, never executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop the whole agent.
    Halt,
    /// Stop the whole agent and signal the embedding binary to re-exec.
    Restart,
    /// Suspend a task's triggers, preserving its last state.
    Pause,
    /// Clear a pause and immediately trigger one incremental pass.
    Resume,
    /// Trigger an incremental pass.
    SyncLoop,
    /// Trigger a full, non-dry reconciliation.
    Resync,
    /// Trigger a full reconciliation without applying changes.
    ResyncDry,
    /// Ask a syncer to publish its state snapshot and store handle.
    ///
    /// With `reply: Some(topic)` this is the request half of the
    /// request/response idiom: the syncer answers on the reply topic with
    /// [`Message::Store`] followed by [`Message::State`]. With `reply: None`
    /// the snapshot is re-broadcast on the task and state topics.
    PublishState {
        /// Where to send the reply, if the caller is waiting for one.
        reply: Option<Topic>,
    },
    /// Stop one task cleanly, letting it flush state first (removal path).
    HaltClean,
    /// Stop one task cleanly ahead of a replacement instance (update path).
    RestartClean,
}

impl Command {
    /// Stable wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Halt => "halt",
            Command::Restart => "restart",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::SyncLoop => "sync-loop",
            Command::Resync => "resync",
            Command::ResyncDry => "resync-dry",
            Command::PublishState { .. } => "publish-state",
            Command::HaltClean => "halt-clean",
            Command::RestartClean => "restart-clean",
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "halt" => Ok(Command::Halt),
            "restart" => Ok(Command::Restart),
            "pause" => Ok(Command::Pause),
            "resume" => Ok(Command::Resume),
            "sync-loop" => Ok(Command::SyncLoop),
            "resync" => Ok(Command::Resync),
            "resync-dry" => Ok(Command::ResyncDry),
            "publish-state" => Ok(Command::PublishState { reply: None }),
            "halt-clean" => Ok(Command::HaltClean),
            "restart-clean" => Ok(Command::RestartClean),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Progress report forwarded from the engine onto a task's topic.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Task identity.
    pub task: String,
    /// Endpoint the report concerns.
    pub side: Side,
    /// Engine-supplied detail string.
    pub detail: String,
}

/// One message on the bus.
#[derive(Debug, Clone)]
pub enum Message {
    /// A control command.
    Command(Command),
    /// A state snapshot (copy-out; never a shared pointer).
    State(TaskState),
    /// An update-progress event from the engine.
    Progress(ProgressEvent),
    /// A completed reconciliation pass.
    PatchDone {
        /// Task identity.
        task: String,
        /// The completed patch.
        patch: Arc<Patch>,
    },
    /// A patch store read handle, sent in reply to a store request.
    Store(PatchReader),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_round_trip() {
        for name in [
            "halt",
            "restart",
            "pause",
            "resume",
            "sync-loop",
            "resync",
            "resync-dry",
            "publish-state",
            "halt-clean",
            "restart-clean",
        ] {
            let cmd: Command = name.parse().unwrap();
            assert_eq!(cmd.as_str(), name);
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = "explode".parse::<Command>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(s) if s == "explode"));
    }
}
