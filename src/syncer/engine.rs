//! Seam to the external sync engine.
//!
//! The control plane never implements tree diffing or backend adapters; it
//! drives one opaque [`SyncEngine`] per task and consumes its event channel.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::TaskConfig;
use crate::error::EngineError;
use crate::store::{Patch, Side};

/// Notification emitted by the engine while a task runs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Progress detail for one endpoint.
    Progress {
        /// Endpoint the report concerns.
        side: Side,
        /// Engine-supplied detail string.
        detail: String,
    },
    /// The realtime watch on one endpoint (re)connected.
    WatchConnected(Side),
    /// The realtime watch on one endpoint disconnected.
    WatchDisconnected(Side),
    /// A reconciliation pass completed; the patch lists what it applied.
    PatchReady(Patch),
}

/// One task's sync engine (external collaborator).
///
/// `resync` returns once the pass has completed or failed; a pass that
/// changed anything also delivers its [`EngineEvent::PatchReady`] on the
/// event channel returned by `start`, while a no-change pass emits nothing.
/// Progress and watch connectivity arrive on the same channel. The syncer
/// calls methods sequentially, never concurrently.
#[async_trait]
pub trait SyncEngine: Send + 'static {
    /// Starts the engine and returns its event channel.
    async fn start(&mut self) -> Result<mpsc::Receiver<EngineEvent>, EngineError>;

    /// Shuts the engine down cleanly; called exactly once on stop.
    async fn shutdown(&mut self) -> Result<(), EngineError>;

    /// Triggers a reconciliation pass.
    ///
    /// `force = false` is an incremental pass; `force = true` a full one.
    /// `dry_run = true` computes the diff without applying changes.
    async fn resync(&mut self, dry_run: bool, force: bool) -> Result<(), EngineError>;

    /// Suspends the engine's own activity (watches keep their connections).
    async fn pause(&mut self) -> Result<(), EngineError>;

    /// Resumes after [`pause`](Self::pause).
    async fn resume(&mut self) -> Result<(), EngineError>;
}

/// Builds one engine per task so the supervisor can construct syncers for
/// dynamically added tasks.
pub type EngineFactory =
    Arc<dyn Fn(&TaskConfig) -> Result<Box<dyn SyncEngine>, EngineError> + Send + Sync>;
