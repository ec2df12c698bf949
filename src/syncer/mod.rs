//! # Syncer: per-task service driving one sync engine.
//!
//! One syncer owns one [`SyncEngine`] instance, its [`FileStateStore`], and
//! its [`PatchStore`]. It blocks on a select across the task's bus
//! subscription (own topic plus the all-tasks broadcast), the engine's event
//! channel, an internal incremental-pass timer, and its cancellation token.
//!
//! ## States
//! `Idle → Processing → (Idle | Error)`, plus the orthogonal `Paused` flag
//! which suspends triggering while preserving the last state; `Removed` is
//! terminal.
//!
//! ## Rules
//! - Every engine-originated event is both applied to the state store and
//!   forwarded onto the task's own topic, so other subscribers observe it
//!   without coupling to the engine's native event type.
//! - Completed patches are handed to the patch store; empty patches are
//!   discarded there.
//! - Stop is a clean sequence: engine shutdown, stores stopped, subscription
//!   dropped. Safe against the restart race (a second stop finds nothing to
//!   do).

mod engine;

pub use engine::{EngineEvent, EngineFactory, SyncEngine};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Command, Message, ProgressEvent, Topic};
use crate::config::{AgentConfig, TaskConfig};
use crate::store::{FileStateStore, PatchStore, TaskStatus};

/// Per-task service: consumes triggers and commands, drives the engine, and
/// publishes state and patches.
pub struct Syncer {
    cfg: TaskConfig,
    bus: Bus,
    engine: Box<dyn SyncEngine>,
    state: FileStateStore,
    patches: Option<PatchStore>,
    loop_interval: std::time::Duration,
    paused: bool,
}

impl Syncer {
    /// Builds the syncer, binding the engine to the task's derived patch
    /// container and state store.
    ///
    /// A patch container that fails to open leaves the task running with
    /// patch persistence marked unavailable for its lifetime (logged once,
    /// no retry loop).
    pub fn new(
        cfg: TaskConfig,
        agent: &AgentConfig,
        bus: Bus,
        engine: Box<dyn SyncEngine>,
        db: &sled::Db,
    ) -> Self {
        let marker = agent.status_path(&cfg.id);
        let recovered = FileStateStore::recover(&marker);
        let state = FileStateStore::new(&cfg.id, bus.clone(), marker);

        // A recovered marker is the last known status; publish it so
        // observers see it before the engine reconnects. `Removed` is not
        // carried over: a task that is configured again starts fresh.
        if let Some(prev) = recovered {
            debug!(task = %cfg.id, status = prev.as_label(), "recovered status marker from previous run");
            if prev != TaskStatus::Removed {
                state.set_status(prev);
            }
        }

        let patches = match PatchStore::open(db, &cfg.id) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(task = %cfg.id, error = %e, "patch container unavailable for this task");
                None
            }
        };

        Self {
            cfg,
            bus,
            engine,
            state,
            patches,
            loop_interval: agent.loop_interval,
            paused: false,
        }
    }

    /// Runs until cancelled or told to halt; then shuts down cleanly.
    pub async fn run(mut self, token: CancellationToken) {
        let task_topic = Topic::for_task(&self.cfg.id);
        let mut sub = self.bus.subscribe(&[task_topic.clone(), Topic::all_tasks()]);

        let mut events = match self.engine.start().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(task = %self.cfg.id, error = %e, "engine failed to start");
                self.state.set_error(e.to_string());
                None
            }
        };

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.loop_interval,
            self.loop_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(task = %self.cfg.id, label = %self.cfg.label, "syncer started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,

                msg = sub.recv() => match msg {
                    Some(Message::Command(cmd)) => {
                        if !self.handle_command(cmd, &task_topic).await {
                            break;
                        }
                    }
                    // State/progress/patch messages on these topics are our
                    // own forwards; not commands for us.
                    Some(_) => {}
                    None => break,
                },

                ev = recv_event(&mut events) => match ev {
                    Some(ev) => self.handle_engine_event(ev, &task_topic).await,
                    None => events = None,
                },

                _ = ticker.tick() => {
                    if !self.paused {
                        self.trigger_incremental().await;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Handles one bus command; returns `false` when the syncer must stop.
    async fn handle_command(&mut self, cmd: Command, task_topic: &Topic) -> bool {
        match cmd {
            Command::SyncLoop => {
                if self.paused {
                    debug!(task = %self.cfg.id, "ignoring sync-loop while paused");
                } else {
                    self.trigger_incremental().await;
                }
            }
            Command::Resync => self.run_resync(false).await,
            Command::ResyncDry => self.run_resync(true).await,
            Command::Pause => {
                self.paused = true;
                if let Err(e) = self.engine.pause().await {
                    warn!(task = %self.cfg.id, error = %e, "engine pause failed");
                }
                self.state.set_status(TaskStatus::Paused);
            }
            Command::Resume => {
                self.paused = false;
                if let Err(e) = self.engine.resume().await {
                    warn!(task = %self.cfg.id, error = %e, "engine resume failed");
                }
                self.state.set_status(TaskStatus::Idle);
                self.trigger_incremental().await;
            }
            Command::PublishState { reply } => match reply {
                Some(reply) => {
                    if let Some(store) = &self.patches {
                        self.bus.publish(Message::Store(store.reader()), &reply);
                    }
                    self.bus
                        .publish(Message::State(self.state.snapshot()), &reply);
                }
                None => {
                    let snap = self.state.snapshot();
                    self.bus.publish(Message::State(snap.clone()), task_topic);
                    self.bus.publish(Message::State(snap), &Topic::state());
                }
            },
            Command::HaltClean => {
                // Removal path: flush a terminal status before teardown.
                self.state.set_status(TaskStatus::Removed);
                return false;
            }
            Command::RestartClean | Command::Halt | Command::Restart => return false,
        }
        true
    }

    /// Applies one engine event to the state store and forwards it onto the
    /// task's own topic.
    async fn handle_engine_event(&mut self, ev: EngineEvent, task_topic: &Topic) {
        match ev {
            EngineEvent::Progress { side, detail } => {
                self.state.set_process(side, detail.clone());
                self.bus.publish(
                    Message::Progress(ProgressEvent {
                        task: self.cfg.id.clone(),
                        side,
                        detail,
                    }),
                    task_topic,
                );
            }
            EngineEvent::WatchConnected(side) => {
                let snap = self.state.set_connected(side, true);
                self.bus.publish(Message::State(snap), task_topic);
                if !self.paused {
                    // Reconnect catches up with anything missed while away.
                    self.trigger_incremental().await;
                }
            }
            EngineEvent::WatchDisconnected(side) => {
                let snap = self.state.set_connected(side, false);
                self.bus.publish(Message::State(snap), task_topic);
            }
            EngineEvent::PatchReady(patch) => {
                self.state.mark_synced();
                self.state.set_status(TaskStatus::Idle);

                if let Some(store) = &self.patches {
                    store.store(patch.clone()).await;
                }
                self.bus.publish(
                    Message::PatchDone {
                        task: self.cfg.id.clone(),
                        patch: Arc::new(patch),
                    },
                    task_topic,
                );
            }
        }
    }

    /// Incremental pass, exactly as an external `SyncLoop` command.
    ///
    /// A pass that resolves without error returns the status to `Idle` even
    /// when it produced no patch, so a no-change pass never leaves the task
    /// reporting `Processing`.
    async fn trigger_incremental(&mut self) {
        self.state.set_status(TaskStatus::Processing);
        match self.engine.resync(false, false).await {
            Ok(()) => {
                self.state.set_status(TaskStatus::Idle);
            }
            Err(e) => {
                warn!(task = %self.cfg.id, error = %e, "incremental pass failed");
                self.state.set_error(e.to_string());
            }
        }
    }

    /// Full reconciliation; `dry_run` computes without applying.
    async fn run_resync(&mut self, dry_run: bool) {
        self.state.set_status(TaskStatus::Processing);
        match self.engine.resync(dry_run, true).await {
            Ok(()) => {
                self.state.set_status(TaskStatus::Idle);
            }
            Err(e) => {
                warn!(task = %self.cfg.id, dry_run, error = %e, "resync failed");
                self.state.set_error(e.to_string());
            }
        }
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.engine.shutdown().await {
            warn!(task = %self.cfg.id, error = %e, "engine shutdown reported an error");
        }
        if let Some(store) = &self.patches {
            store.stop().await;
        }
        self.state.stop().await;
        info!(task = %self.cfg.id, "syncer stopped");
        // Dropping the subscription (already out of scope) unsubscribes.
    }
}

/// Receives from the engine channel, or parks forever once it is gone so the
/// select loop keeps serving bus commands.
async fn recv_event(events: &mut Option<mpsc::Receiver<EngineEvent>>) -> Option<EngineEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
