//! Task and agent configuration.
//!
//! [`TaskConfig`] is an immutable snapshot of one configured synchronization
//! relationship; the control plane only reads it. [`ConfigEvent`] is the
//! change feed the supervisor reconciles against. [`AgentConfig`] carries the
//! global runtime knobs (bus capacity, grace period, timer defaults, data
//! directory).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Direction of reconciliation between the two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Changes flow both ways; conflicts are the engine's problem.
    Bidirectional,
    /// The left endpoint is authoritative.
    LeftWins,
    /// The right endpoint is authoritative.
    RightWins,
}

/// One configured synchronization task.
///
/// Owned by the configuration layer; the control plane receives cloned
/// snapshots and never mutates them. A task's identity (`id`) is opaque and
/// stable: per-task topics and the durable patch container are derived from
/// it, so they survive restarts as long as the id is unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Opaque unique identity.
    pub id: String,
    /// Human-readable label for display.
    pub label: String,
    /// Left endpoint URI.
    pub left: String,
    /// Right endpoint URI.
    pub right: String,
    /// Reconciliation direction.
    pub direction: SyncDirection,
    /// Optional allow-list of sub-paths; `None` means the whole tree.
    pub paths: Option<Vec<String>>,
    /// Whether the engine should watch the endpoints for realtime changes.
    pub watch: bool,
    /// Cadence expression for incremental passes (e.g. "10m"), if any.
    pub loop_cadence: Option<String>,
    /// Cadence expression for full resync passes (e.g. "24h"), if any.
    pub resync_cadence: Option<String>,
}

impl TaskConfig {
    /// Minimal constructor; scheduling and path filters default to off.
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
        direction: SyncDirection,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            left: left.into(),
            right: right.into(),
            direction,
            paths: None,
            watch: false,
            loop_cadence: None,
            resync_cadence: None,
        }
    }

    /// Validates the fields the control plane depends on.
    ///
    /// A task failing validation is skipped at registration time; it never
    /// prevents other tasks from starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::EmptyId);
        }
        if self.left.is_empty() {
            return Err(ConfigError::MissingEndpoint {
                task: self.id.clone(),
                side: "left",
            });
        }
        if self.right.is_empty() {
            return Err(ConfigError::MissingEndpoint {
                task: self.id.clone(),
                side: "right",
            });
        }
        Ok(())
    }
}

/// A configuration change observed on the external feed.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A task was added to the configuration.
    Created(TaskConfig),
    /// An existing task was modified; the running instance must be replaced.
    Updated(TaskConfig),
    /// A task was removed; its services must be stopped and dropped.
    Removed(TaskConfig),
}

impl ConfigEvent {
    /// Identity of the task this event concerns.
    pub fn task_id(&self) -> &str {
        match self {
            ConfigEvent::Created(t) | ConfigEvent::Updated(t) | ConfigEvent::Removed(t) => &t.id,
        }
    }
}

/// Global runtime configuration for the agent's control plane.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Per-subscriber bus queue capacity (clamped to at least 1).
    pub bus_capacity: usize,
    /// Delay between stopping a replaced task instance and registering its
    /// successor. Also bounds the total shutdown wait.
    pub grace: Duration,
    /// Interval of each syncer's internal incremental trigger.
    pub loop_interval: Duration,
    /// How long a request/response caller waits for a store handle reply.
    pub reply_timeout: Duration,
    /// Root directory for the patch containers and status marker files.
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bus_capacity: 64,
            grace: Duration::from_secs(5),
            loop_interval: Duration::from_secs(600),
            reply_timeout: Duration::from_millis(100),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl AgentConfig {
    /// Bus queue capacity, never below 1.
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Directory of the sled database holding all patch containers.
    pub fn patches_path(&self) -> PathBuf {
        self.data_dir.join("patches")
    }

    /// Status marker file for one task.
    pub fn status_path(&self, task: &str) -> PathBuf {
        self.data_dir.join("status").join(format!("{task}.status"))
    }
}
