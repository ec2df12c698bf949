//! External entry points: command dispatch and history queries.
//!
//! Both run outside any syncer's execution context, so neither touches a
//! syncer directly. Dispatch parses an envelope and publishes the command on
//! the addressed topic; history goes through the request/response idiom to
//! borrow a read handle on the task's patch container.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::{self, Bus, Command, Message, Topic};
use crate::error::{HistoryError, ProtocolError};
use crate::store::{Patch, PatchReader, TaskState};

/// Wire envelope for externally submitted commands.
///
/// An empty `task_id` addresses the agent as a whole (the global topic);
/// anything else addresses one task's topic. The command string must name a
/// member of the closed [`Command`] enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdEnvelope {
    /// Target task identity; empty for agent-wide commands.
    #[serde(default)]
    pub task_id: String,
    /// Wire name of the command, e.g. `"resync"` or `"halt"`.
    pub command: String,
}

impl CmdEnvelope {
    pub fn new(task_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            command: command.into(),
        }
    }

    /// Topic this envelope addresses.
    pub fn topic(&self) -> Topic {
        if self.task_id.is_empty() {
            Topic::global()
        } else {
            Topic::for_task(&self.task_id)
        }
    }
}

/// Parses a JSON envelope and publishes its command.
///
/// Rejection happens entirely at this boundary: a malformed envelope or an
/// unknown command name returns an error and publishes nothing.
pub fn dispatch_json(bus: &Bus, raw: &str) -> Result<(), ProtocolError> {
    let envelope: CmdEnvelope = serde_json::from_str(raw)?;
    dispatch_envelope(bus, &envelope)
}

/// Validates and publishes an already-decoded envelope.
pub fn dispatch_envelope(bus: &Bus, envelope: &CmdEnvelope) -> Result<(), ProtocolError> {
    let command = Command::from_str(&envelope.command)?;
    let topic = envelope.topic();
    debug!(topic = %topic, cmd = command.as_str(), "dispatching external command");
    bus.publish(Message::Command(command), &topic);
    Ok(())
}

/// Borrows a read handle on one task's patch container.
///
/// Sends a store request to the task's topic and waits up to `timeout` for
/// the handle. A task that is not running (or does not answer in time) is
/// reported as unavailable; the caller decides whether that is an error.
pub async fn fetch_store(
    bus: &Bus,
    task: &str,
    timeout: Duration,
) -> Result<PatchReader, HistoryError> {
    bus::request(
        bus,
        &Topic::for_task(task),
        timeout,
        |reply| Message::Command(Command::PublishState { reply: Some(reply) }),
        |msg| match msg {
            Message::Store(reader) => Some(reader),
            _ => None,
        },
    )
    .await
    .ok_or_else(|| HistoryError::Unavailable {
        task: task.to_string(),
    })
}

/// One page of a task's persisted patches, newest first.
///
/// `offset` skips that many patches from the newest end; `limit` caps the
/// page size. An offset past the end yields an empty page, not an error.
pub async fn query_history(
    bus: &Bus,
    task: &str,
    offset: usize,
    limit: usize,
    timeout: Duration,
) -> Result<Vec<Patch>, HistoryError> {
    let reader = fetch_store(bus, task, timeout).await?;
    Ok(page(reader.load_all()?, offset, limit))
}

/// Like [`query_history`], restricted to one source/target endpoint pair.
pub async fn query_history_between(
    bus: &Bus,
    task: &str,
    source: &str,
    target: &str,
    offset: usize,
    limit: usize,
    timeout: Duration,
) -> Result<Vec<Patch>, HistoryError> {
    let reader = fetch_store(bus, task, timeout).await?;
    Ok(page(reader.load(source, target)?, offset, limit))
}

fn page(patches: Vec<Patch>, offset: usize, limit: usize) -> Vec<Patch> {
    patches.into_iter().skip(offset).take(limit).collect()
}

/// Current state snapshot of one task, via the same request/response path.
pub async fn query_state(
    bus: &Bus,
    task: &str,
    timeout: Duration,
) -> Result<TaskState, HistoryError> {
    bus::request(
        bus,
        &Topic::for_task(task),
        timeout,
        |reply| Message::Command(Command::PublishState { reply: Some(reply) }),
        |msg| match msg {
            Message::State(state) => Some(state),
            _ => None,
        },
    )
    .await
    .ok_or_else(|| HistoryError::Unavailable {
        task: task.to_string(),
    })
}
