//! # Per-task runtime state.
//!
//! [`MemoryStateStore`] holds the latest observed status of a task behind a
//! lock; every mutator returns the new snapshot, and mutating the overall
//! task status additionally publishes that snapshot on the global state
//! topic for broadcast. State crosses execution contexts only as copy-out
//! snapshots, never as shared pointers.
//!
//! [`FileStateStore`] wraps the in-memory variant and mirrors the coarse
//! task status to a small on-disk marker file, so that after a crash the
//! last known status can be displayed before the task has reconnected. The
//! mutation call path never blocks on disk I/O: status changes are handed to
//! a dedicated background writer over a small buffered channel.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::bus::{Bus, Message, Topic};

/// Which endpoint of a task a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// Coarse overall status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Processing,
    Paused,
    Error,
    /// Terminal; set when the task is removed from configuration.
    Removed,
}

impl TaskStatus {
    /// Stable label written to the status marker file.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Processing => "processing",
            TaskStatus::Paused => "paused",
            TaskStatus::Error => "error",
            TaskStatus::Removed => "removed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "idle" => Ok(TaskStatus::Idle),
            "processing" => Ok(TaskStatus::Processing),
            "paused" => Ok(TaskStatus::Paused),
            "error" => Ok(TaskStatus::Error),
            "removed" => Ok(TaskStatus::Removed),
            _ => Err(()),
        }
    }
}

/// Connection and activity bookkeeping for one endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointState {
    /// Whether the engine's watch on this endpoint is connected.
    pub connected: bool,
    /// When the last completed pass touched this endpoint.
    pub last_sync: Option<DateTime<Utc>>,
    /// When the engine last reported activity on this endpoint.
    pub last_ops: Option<DateTime<Utc>>,
    /// Last process status message from the engine for this endpoint.
    pub process: String,
}

/// Copy-out snapshot of a task's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Task identity.
    pub task: String,
    /// Overall status.
    pub status: TaskStatus,
    /// Left endpoint bookkeeping.
    pub left: EndpointState,
    /// Right endpoint bookkeeping.
    pub right: EndpointState,
    /// Last error message, if the status is or was `Error`.
    pub last_error: Option<String>,
}

impl TaskState {
    fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            status: TaskStatus::Idle,
            left: EndpointState::default(),
            right: EndpointState::default(),
            last_error: None,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut EndpointState {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

/// In-memory state store; mutated exclusively by the owning syncer.
pub struct MemoryStateStore {
    inner: Mutex<TaskState>,
    bus: Bus,
}

impl MemoryStateStore {
    /// Creates the store for one task, starting at [`TaskStatus::Idle`].
    pub fn new(task: &str, bus: Bus) -> Self {
        Self {
            inner: Mutex::new(TaskState::new(task)),
            bus,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TaskState {
        self.inner.lock().clone()
    }

    /// Sets the overall status and broadcasts the new snapshot on the
    /// global state topic.
    pub fn set_status(&self, status: TaskStatus) -> TaskState {
        let snap = {
            let mut state = self.inner.lock();
            state.status = status;
            state.clone()
        };
        self.bus.publish(Message::State(snap.clone()), &Topic::state());
        snap
    }

    /// Records an error message and switches the status to `Error`.
    pub fn set_error(&self, error: impl Into<String>) -> TaskState {
        {
            let mut state = self.inner.lock();
            state.last_error = Some(error.into());
        }
        self.set_status(TaskStatus::Error)
    }

    /// Updates one endpoint's watch connection flag.
    pub fn set_connected(&self, side: Side, connected: bool) -> TaskState {
        let mut state = self.inner.lock();
        state.side_mut(side).connected = connected;
        state.clone()
    }

    /// Records an engine process message for one endpoint and bumps its
    /// activity timestamp.
    pub fn set_process(&self, side: Side, process: impl Into<String>) -> TaskState {
        let mut state = self.inner.lock();
        let endpoint = state.side_mut(side);
        endpoint.process = process.into();
        endpoint.last_ops = Some(Utc::now());
        state.clone()
    }

    /// Stamps both endpoints with a completed pass.
    pub fn mark_synced(&self) -> TaskState {
        let now = Utc::now();
        let mut state = self.inner.lock();
        state.left.last_sync = Some(now);
        state.right.last_sync = Some(now);
        state.clone()
    }
}

/// File-backed state store: the in-memory variant plus a coarse status
/// marker file maintained by a background writer.
pub struct FileStateStore {
    mem: MemoryStateStore,
    tx: Mutex<Option<mpsc::Sender<TaskStatus>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileStateStore {
    /// Queue depth between status mutators and the marker writer.
    const MARKER_QUEUE: usize = 8;

    /// Creates the store and starts the marker writer for `path`.
    pub fn new(task: &str, bus: Bus, path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(Self::MARKER_QUEUE);
        let writer = tokio::spawn(marker_writer(task.to_string(), path, rx));

        Self {
            mem: MemoryStateStore::new(task, bus),
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Reads the last persisted status marker, if one survives from a
    /// previous run.
    pub fn recover(path: &Path) -> Option<TaskStatus> {
        let raw = std::fs::read_to_string(path).ok()?;
        raw.parse().ok()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TaskState {
        self.mem.snapshot()
    }

    /// Sets the overall status; broadcasts the snapshot and hands the coarse
    /// status to the marker writer without blocking on disk I/O.
    pub fn set_status(&self, status: TaskStatus) -> TaskState {
        let snap = self.mem.set_status(status);
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.try_send(status).is_err() {
                debug!(task = %snap.task, "status marker write skipped: queue full or stopped");
            }
        }
        snap
    }

    /// See [`MemoryStateStore::set_error`]; the `Error` status is mirrored
    /// to the marker file.
    pub fn set_error(&self, error: impl Into<String>) -> TaskState {
        let snap = self.mem.set_error(error);
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.try_send(TaskStatus::Error);
        }
        snap
    }

    /// See [`MemoryStateStore::set_connected`].
    pub fn set_connected(&self, side: Side, connected: bool) -> TaskState {
        self.mem.set_connected(side, connected)
    }

    /// See [`MemoryStateStore::set_process`].
    pub fn set_process(&self, side: Side, process: impl Into<String>) -> TaskState {
        self.mem.set_process(side, process)
    }

    /// See [`MemoryStateStore::mark_synced`].
    pub fn mark_synced(&self) -> TaskState {
        self.mem.mark_synced()
    }

    /// Stops the marker writer after draining queued status changes.
    /// Idempotent.
    pub async fn stop(&self) {
        let tx = self.tx.lock().take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

async fn marker_writer(task: String, path: PathBuf, mut rx: mpsc::Receiver<TaskStatus>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(task = %task, error = %e, "cannot create status marker directory");
            return;
        }
    }

    while let Some(status) = rx.recv().await {
        if let Err(e) = tokio::fs::write(&path, status.as_label()).await {
            error!(task = %task, error = %e, "failed to write status marker");
        }
    }
}
