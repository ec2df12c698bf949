//! # syncvisor
//!
//! **Syncvisor** is the control plane of a multi-folder synchronization
//! agent: it supervises one long-lived service per configured task, wires
//! them together over an in-process pub/sub bus, and keeps a durable history
//! of every reconciliation pass.
//!
//! The actual file transfer is delegated to a pluggable [`SyncEngine`]; this
//! crate owns lifecycle, messaging, scheduling, and persistence.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!    ┌──────────────┐  ┌──────────────┐        config feed
//!    │  TaskConfig  │  │  TaskConfig  │  ──► (Created/Updated/Removed)
//!    └──────┬───────┘  └──────┬───────┘             │
//!           ▼                 ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                 │
//! │  - services: task id ─► ServiceHandle (token + join handle) │
//! │  - scheduler handle (rebuilt on every config change)        │
//! │  - sled::Db (one patch container Tree per task)             │
//! └───────┬─────────────────┬─────────────────────┬─────────────┘
//!         ▼                 ▼                     ▼
//!    ┌─────────┐       ┌─────────┐          ┌───────────┐
//!    │ Syncer  │       │ Syncer  │          │ Scheduler │
//!    │ task a  │       │ task b  │          │ (tickers) │
//!    └──┬──────┘       └──┬──────┘          └─────┬─────┘
//!       │ subscribes:     │                       │ publishes
//!       │  task:a         │  task:b               │  SyncLoop / Resync
//!       │  tasks:all      │  tasks:all            │  on task:<id>
//!       ▼                 ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bus (topic-partitioned fan-out, bounded queues, try_send)  │
//! │  topics: global · tasks:all · task:<id> · state · reply:<n> │
//! └─────────────────────────────────────────────────────────────┘
//!       ▲                                         ▲
//!       │ CmdEnvelope (JSON)                      │ PublishState{reply}
//!   history::dispatch_json               history::query_history
//! ```
//!
//! ### Syncer lifecycle
//! ```text
//! Supervisor::register_task
//!   ├─► engine factory builds the task's SyncEngine
//!   ├─► FileStateStore (status marker recovered from a previous run)
//!   ├─► PatchStore (sled Tree keyed by task id)
//!   └─► ServiceHandle::spawn(Syncer::run)
//!
//! Syncer::run loop {
//!   ├─ command on task:<id> / tasks:all ─► pause, resume, resync, ...
//!   ├─ engine event ─► progress, watch connectivity, completed patch
//!   │       PatchReady ─► persist to PatchStore + publish PatchDone
//!   ├─ loop ticker ─► incremental pass (unless paused)
//!   └─ cancel / halt ─► engine shutdown, drain writers, exit
//! }
//! ```
//!
//! ## Features
//! | Area           | Description                                              | Key types                                |
//! |----------------|----------------------------------------------------------|------------------------------------------|
//! | **Supervision**| Dynamic add/update/remove of task services.              | [`Supervisor`], [`ServiceHandle`]        |
//! | **Messaging**  | Topic pub/sub plus bounded request/response.             | [`Bus`], [`Topic`], [`Message`]          |
//! | **Tasks**      | Per-task orchestration around a pluggable engine.        | [`Syncer`], [`SyncEngine`]               |
//! | **Scheduling** | Cadence tickers translated into bus commands.            | [`Scheduler`]                            |
//! | **History**    | Durable patch containers with atomic replace.            | [`PatchStore`], [`PatchReader`], [`Patch`] |
//! | **State**      | Live task state with a crash-surviving status marker.    | [`TaskState`], [`FileStateStore`]        |
//! | **Errors**     | Typed errors per failure domain.                         | [`ConfigError`], [`RuntimeError`]        |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use syncvisor::{
//!     AgentConfig, Bus, EngineError, EngineEvent, Supervisor, SyncDirection, SyncEngine,
//!     TaskConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! // Engine stub; a real one drives the transfer backend.
//! struct Noop(Option<mpsc::Receiver<EngineEvent>>);
//!
//! #[async_trait::async_trait]
//! impl SyncEngine for Noop {
//!     async fn start(&mut self) -> Result<mpsc::Receiver<EngineEvent>, EngineError> {
//!         self.0.take().ok_or_else(|| EngineError::msg("already started"))
//!     }
//!     async fn shutdown(&mut self) -> Result<(), EngineError> { Ok(()) }
//!     async fn resync(&mut self, _dry: bool, _force: bool) -> Result<(), EngineError> { Ok(()) }
//!     async fn pause(&mut self) -> Result<(), EngineError> { Ok(()) }
//!     async fn resume(&mut self) -> Result<(), EngineError> { Ok(()) }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = AgentConfig::default();
//!     let bus = Bus::new(cfg.bus_capacity_clamped());
//!
//!     let sup = Supervisor::new(cfg, bus.clone(), Arc::new(|_task: &TaskConfig| {
//!         let (_tx, rx) = mpsc::channel(8);
//!         Ok(Box::new(Noop(Some(rx))) as Box<dyn SyncEngine>)
//!     }))?;
//!
//!     let task = TaskConfig::new(
//!         "photos", "Photos", "file:///home/me/photos", "file:///mnt/backup/photos",
//!         SyncDirection::Bidirectional,
//!     );
//!
//!     let (_feed_tx, feed) = mpsc::channel(16);
//!     sup.run(vec![task], feed).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod scheduler;
mod supervisor;

pub mod bus;
pub mod history;
pub mod store;
pub mod syncer;

// ---- Public re-exports ----

pub use bus::{Bus, Command, Message, ProgressEvent, Topic};
pub use config::{AgentConfig, ConfigEvent, SyncDirection, TaskConfig};
pub use error::{
    ConfigError, EngineError, HistoryError, ProtocolError, RuntimeError, StoreError,
};
pub use history::CmdEnvelope;
pub use scheduler::Scheduler;
pub use store::{
    FileStateStore, OpKind, Operation, Patch, PatchReader, PatchStore, Side, TaskState,
    TaskStatus,
};
pub use supervisor::{wait_for_shutdown_signal, Disposition, ServiceHandle, Supervisor};
pub use syncer::{EngineEvent, EngineFactory, SyncEngine, Syncer};
