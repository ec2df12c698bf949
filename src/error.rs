//! Error types used across the control plane.
//!
//! The taxonomy mirrors how failures propagate:
//!
//! - [`ConfigError`]: a malformed task configuration; the task is skipped,
//!   never fatal to the supervisor.
//! - [`EngineError`]: raised by the external sync engine; reflected into
//!   task state, never propagated as a process failure.
//! - [`StoreError`]: durable patch container failures; logged, and the
//!   store is marked unavailable for the task's lifetime.
//! - [`ProtocolError`]: unparseable payloads crossing the external message
//!   boundary; reported back to the remote caller.
//! - [`HistoryError`]: a patch-history lookup that could not reach a live
//!   store (a retrievable condition, not a permanent failure).
//! - [`RuntimeError`]: failures of the orchestration runtime itself.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while validating a task configuration.
///
/// These never stop the supervisor: the offending task is logged and skipped.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Task identity is empty; topics and store containers key off it.
    #[error("task id must not be empty")]
    EmptyId,

    /// One of the two endpoint URIs is missing.
    #[error("task '{task}': missing {side} endpoint URI")]
    MissingEndpoint {
        /// Task identity.
        task: String,
        /// Which side is missing ("left" or "right").
        side: &'static str,
    },
}

/// Error raised by a [`SyncEngine`](crate::syncer::SyncEngine) call.
///
/// The control plane treats these as transient: they are written into the
/// task's state and the syncer keeps running.
#[derive(Error, Debug)]
#[error("engine: {0}")]
pub struct EngineError(pub String);

impl EngineError {
    /// Convenience constructor from anything displayable.
    pub fn msg(m: impl std::fmt::Display) -> Self {
        Self(m.to_string())
    }
}

/// Errors produced by the durable patch store.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying sled container failed (open, read, or write).
    #[error("patch container error: {0}")]
    Backend(#[from] sled::Error),

    /// A patch or operation failed to encode.
    #[error("patch encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

/// Errors produced at the external message boundary.
///
/// Unknown or malformed commands are rejected with an explicit error reply;
/// they are never executed and never crash the dispatching task.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The command string does not map to any known command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The JSON envelope could not be parsed.
    #[error("malformed command envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}

/// Failure of a patch-history lookup.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HistoryError {
    /// No syncer with that identity answered within the reply timeout.
    ///
    /// This is "store unavailable", not an error about the patches; callers
    /// should surface it as a retrievable condition.
    #[error("patch store for task '{task}' is currently unavailable")]
    Unavailable {
        /// Task identity the lookup targeted.
        task: String,
    },

    /// The store answered but reading it failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the orchestration runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some services remained stuck.
    #[error("shutdown grace {grace:?} exceeded; still running: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of services that did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

impl HistoryError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            HistoryError::Unavailable { .. } => "history_unavailable",
            HistoryError::Store(_) => "history_store",
        }
    }
}
