//! # Supervisor: owns the set of running services.
//!
//! The supervisor builds one [`Syncer`] per configured task plus one
//! [`Scheduler`] over all task configs, registers each under a
//! [`ServiceHandle`], and then serves two loops until stopped: the
//! configuration change feed and the global command relay.
//!
//! ## Reconciliation
//! ```text
//! ConfigEvent::Created(t)  ─► validate ─► register syncer ─► rebuild scheduler
//! ConfigEvent::Updated(t)  ─► publish RestartClean to task topic   (FIRST)
//!                          ─► stop old handle (synchronous)
//!                          ─► sleep(grace)
//!                          ─► register replacement ─► rebuild scheduler
//! ConfigEvent::Removed(t)  ─► publish HaltClean to task topic      (FIRST)
//!                          ─► stop handle, drop map entry ─► rebuild scheduler
//! ```
//! Publishing the clean command before deregistering is a correctness
//! requirement: the outgoing syncer gets its chance to persist final state
//! before teardown. The grace sleep bounds how long an in-flight engine
//! operation may keep running after being told to stop; it is a fixed delay,
//! not a confirmation (known, accepted race).
//!
//! ## Failure semantics
//! A task that fails validation or engine construction is logged and
//! skipped; it never prevents other tasks from starting. Only explicit
//! global halt/restart commands (or an OS signal) stop everything.

mod handle;
mod shutdown;

pub use handle::ServiceHandle;
pub use shutdown::wait_for_shutdown_signal;

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bus::{Bus, Command, Message, Topic};
use crate::config::{AgentConfig, ConfigEvent, TaskConfig};
use crate::error::{RuntimeError, StoreError};
use crate::scheduler::Scheduler;
use crate::syncer::{EngineFactory, Syncer};

/// Why [`Supervisor::run`] returned; the embedding binary re-execs on
/// [`Disposition::Restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Halt,
    Restart,
}

/// Top-level lifecycle manager for all per-task services.
pub struct Supervisor {
    cfg: AgentConfig,
    bus: Bus,
    db: sled::Db,
    engines: EngineFactory,
    /// Single source of truth for "is this task currently running".
    services: RwLock<HashMap<String, ServiceHandle>>,
    scheduler: RwLock<Option<ServiceHandle>>,
    /// Current config snapshot, kept for scheduler rebuilds.
    tasks: RwLock<HashMap<String, TaskConfig>>,
}

impl Supervisor {
    /// Opens the shared patch database and prepares an empty registry.
    pub fn new(cfg: AgentConfig, bus: Bus, engines: EngineFactory) -> Result<Self, StoreError> {
        let db = sled::open(cfg.patches_path())?;
        Ok(Self {
            cfg,
            bus,
            db,
            engines,
            services: RwLock::new(HashMap::new()),
            scheduler: RwLock::new(None),
            tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Runs until an OS signal or a global halt/restart command arrives,
    /// reconciling the service set against the configuration feed.
    ///
    /// Returns the shutdown disposition, or [`RuntimeError::GraceExceeded`]
    /// when some service refused to stop within the grace period.
    pub async fn run(
        &self,
        initial: Vec<TaskConfig>,
        feed: mpsc::Receiver<ConfigEvent>,
    ) -> Result<Disposition, RuntimeError> {
        for task in initial {
            self.register_task(task).await;
        }
        self.rebuild_scheduler().await;

        let mut feed = Some(feed);
        let mut global = self.bus.subscribe(&[Topic::global()]);
        let task_count = self.services.read().await.len();
        info!(tasks = task_count, "supervisor serving");

        // One set of signal listeners for the whole serve loop.
        let shutdown = wait_for_shutdown_signal();
        tokio::pin!(shutdown);

        let disposition = loop {
            tokio::select! {
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        error!(error = %e, "signal listener failed; halting");
                    }
                    break Disposition::Halt;
                }

                ev = recv_config(&mut feed) => match ev {
                    Some(ev) => self.apply_config_event(ev).await,
                    // Feed closed: keep serving commands and signals.
                    None => feed = None,
                },

                // The clean variants forward the plain command to the
                // broadcast topic: the `Removed` marker is reserved for
                // configuration removal, and every syncer still flushes its
                // last status on an ordered stop.
                msg = global.recv() => match msg {
                    Some(Message::Command(Command::Halt)) => break Disposition::Halt,
                    Some(Message::Command(Command::Restart)) => break Disposition::Restart,
                    Some(Message::Command(Command::HaltClean)) => {
                        self.bus.publish(Message::Command(Command::Halt), &Topic::all_tasks());
                        break Disposition::Halt;
                    }
                    Some(Message::Command(Command::RestartClean)) => {
                        self.bus.publish(Message::Command(Command::Restart), &Topic::all_tasks());
                        break Disposition::Restart;
                    }
                    Some(_) => continue,
                    None => break Disposition::Halt,
                },
            }
        };

        info!(?disposition, "supervisor stopping all services");
        self.stop_all().await?;
        Ok(disposition)
    }

    /// Sorted ids of currently registered tasks.
    pub async fn task_ids(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut ids: Vec<String> = services.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a task currently holds a live service handle.
    pub async fn is_running(&self, task: &str) -> bool {
        self.services.read().await.contains_key(task)
    }

    /// Registers an auxiliary long-running worker alongside the task
    /// syncers, so `stop_all` tears it down with everything else on halt.
    ///
    /// A previous registration under the same name is stopped and replaced.
    pub async fn register_service(&self, name: impl Into<String>, handle: ServiceHandle) {
        let name = name.into();
        let old = self.services.write().await.insert(name.clone(), handle);
        if let Some(old) = old {
            warn!(service = %name, "replacing existing service registration");
            old.stop().await;
        }
    }

    /// Applies one configuration change, then re-creates the scheduler so
    /// its ticker set matches the new configuration.
    async fn apply_config_event(&self, ev: ConfigEvent) {
        match ev {
            ConfigEvent::Created(task) => {
                info!(task = %task.id, "config: task created");
                self.register_task(task).await;
            }
            ConfigEvent::Updated(task) => {
                info!(task = %task.id, "config: task updated");
                // Clean restart first, so the old instance can flush state
                // before its handle is deregistered.
                self.bus.publish(
                    Message::Command(Command::RestartClean),
                    &Topic::for_task(&task.id),
                );
                let old = self.services.write().await.remove(&task.id);
                if let Some(old) = old {
                    old.stop().await;
                }
                // Bounds how long an in-flight engine operation may overlap
                // with the replacement; a fixed delay, not a confirmation.
                tokio::time::sleep(self.cfg.grace).await;
                let id = task.id.clone();
                if !self.register_task(task).await {
                    // The replacement never started; a stale config entry
                    // would keep feeding scheduler rebuilds.
                    self.tasks.write().await.remove(&id);
                }
            }
            ConfigEvent::Removed(task) => {
                info!(task = %task.id, "config: task removed");
                self.bus.publish(
                    Message::Command(Command::HaltClean),
                    &Topic::for_task(&task.id),
                );
                let old = self.services.write().await.remove(&task.id);
                if let Some(old) = old {
                    old.stop().await;
                }
                self.tasks.write().await.remove(&task.id);
            }
        }
        self.rebuild_scheduler().await;
    }

    /// Builds and registers one syncer; a task that fails validation or
    /// engine construction is reported and omitted, never fatal. Returns
    /// whether the task actually started.
    async fn register_task(&self, task: TaskConfig) -> bool {
        if let Err(e) = task.validate() {
            error!(task = %task.id, error = %e, "skipping invalid task config");
            return false;
        }
        if self.services.read().await.contains_key(&task.id) {
            warn!(task = %task.id, "task already registered; ignoring duplicate");
            return false;
        }

        let engine = match (self.engines)(&task) {
            Ok(engine) => engine,
            Err(e) => {
                error!(task = %task.id, error = %e, "engine construction failed; task skipped");
                return false;
            }
        };

        let syncer = Syncer::new(task.clone(), &self.cfg, self.bus.clone(), engine, &self.db);
        let handle = ServiceHandle::spawn(|token| syncer.run(token));

        self.services.write().await.insert(task.id.clone(), handle);
        self.tasks.write().await.insert(task.id.clone(), task);
        true
    }

    /// Discards the current scheduler handle and starts a fresh scheduler
    /// over the current task snapshot.
    async fn rebuild_scheduler(&self) {
        let old = self.scheduler.write().await.take();
        if let Some(old) = old {
            old.stop().await;
        }

        let tasks: Vec<TaskConfig> = self.tasks.read().await.values().cloned().collect();
        let scheduler = Scheduler::new(self.bus.clone(), tasks);
        let handle = ServiceHandle::spawn(|token| scheduler.run(token));
        *self.scheduler.write().await = Some(handle);
    }

    /// Stops every registered service, bounded by the grace period.
    ///
    /// Services are cancelled together and joined concurrently; one slow
    /// service cannot delay the cancellation of its siblings.
    async fn stop_all(&self) -> Result<(), RuntimeError> {
        let scheduler = self.scheduler.write().await.take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        let handles: Vec<(String, ServiceHandle)> =
            self.services.write().await.drain().collect();
        let names: Vec<String> = handles.iter().map(|(name, _)| name.clone()).collect();

        for (_, handle) in &handles {
            handle.request_stop();
        }

        let mut set = JoinSet::new();
        for (name, handle) in handles {
            set.spawn(async move {
                handle.stop().await;
                name
            });
        }

        let deadline = tokio::time::Instant::now() + self.cfg.grace;
        let mut stopped = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(name))) => stopped.push(name),
                Ok(Some(Err(_join_err))) => {}
                Ok(None) => return Ok(()),
                Err(_elapsed) => {
                    set.abort_all();
                    let stuck: Vec<String> = names
                        .into_iter()
                        .filter(|n| !stopped.contains(n))
                        .collect();
                    let err = RuntimeError::GraceExceeded {
                        grace: self.cfg.grace,
                        stuck,
                    };
                    error!(label = err.as_label(), "{err}");
                    return Err(err);
                }
            }
        }
    }
}

/// Receives from the config feed, or parks forever once it is closed so the
/// select loop keeps serving commands and signals.
async fn recv_config(feed: &mut Option<mpsc::Receiver<ConfigEvent>>) -> Option<ConfigEvent> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncDirection;
    use crate::error::EngineError;
    use crate::syncer::{EngineEvent, SyncEngine};
    use std::sync::Arc;
    use std::time::Duration;

    /// Engine double that idles until shutdown; `shutdown_delay` simulates a
    /// slow engine stop.
    struct IdleEngine {
        shutdown_delay: Duration,
        events: Option<tokio::sync::mpsc::Receiver<EngineEvent>>,
        _events_tx: tokio::sync::mpsc::Sender<EngineEvent>,
    }

    impl IdleEngine {
        fn factory(shutdown_delay: Duration) -> EngineFactory {
            Arc::new(move |_cfg: &TaskConfig| {
                let (tx, rx) = tokio::sync::mpsc::channel(4);
                Ok(Box::new(IdleEngine {
                    shutdown_delay,
                    events: Some(rx),
                    _events_tx: tx,
                }) as Box<dyn SyncEngine>)
            })
        }
    }

    #[async_trait::async_trait]
    impl SyncEngine for IdleEngine {
        async fn start(&mut self) -> Result<tokio::sync::mpsc::Receiver<EngineEvent>, EngineError> {
            Ok(self.events.take().expect("start called twice"))
        }
        async fn shutdown(&mut self) -> Result<(), EngineError> {
            tokio::time::sleep(self.shutdown_delay).await;
            Ok(())
        }
        async fn resync(&mut self, _dry_run: bool, _force: bool) -> Result<(), EngineError> {
            Ok(())
        }
        async fn pause(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn resume(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn task(id: &str) -> TaskConfig {
        TaskConfig::new(id, "demo", "file:///l", "file:///r", SyncDirection::Bidirectional)
    }

    fn setup(grace: Duration) -> (Arc<Supervisor>, Bus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig {
            grace,
            data_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let bus = Bus::new(32);
        let sup = Arc::new(
            Supervisor::new(cfg, bus.clone(), IdleEngine::factory(Duration::ZERO)).unwrap(),
        );
        (sup, bus, dir)
    }

    #[tokio::test]
    async fn invalid_task_is_skipped_without_stopping_others() {
        let (sup, bus, _dir) = setup(Duration::from_millis(50));
        let (_feed_tx, feed) = mpsc::channel(4);

        let run_sup = sup.clone();
        let run = tokio::spawn(async move {
            run_sup.run(vec![task("good"), task("")], feed).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.task_ids().await, vec!["good".to_string()]);

        bus.publish(Message::Command(Command::Halt), &Topic::global());
        assert_eq!(run.await.unwrap().unwrap(), Disposition::Halt);
    }

    #[tokio::test]
    async fn update_publishes_clean_restart_before_deregistering() {
        let (sup, bus, _dir) = setup(Duration::from_millis(120));
        let (feed_tx, feed) = mpsc::channel(4);
        let mut tap = bus.subscribe(&[Topic::for_task("a")]);

        let run_sup = sup.clone();
        let run = tokio::spawn(async move { run_sup.run(vec![task("a")], feed).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.is_running("a").await);

        feed_tx.send(ConfigEvent::Updated(task("a"))).await.unwrap();

        // The clean-restart command reaches the task topic first...
        loop {
            match tokio::time::timeout(Duration::from_secs(1), tap.recv()).await {
                Ok(Some(Message::Command(Command::RestartClean))) => break,
                Ok(Some(_)) => continue,
                other => panic!("expected restart-clean on the task topic, got {other:?}"),
            }
        }

        // ...then, during the grace window, neither instance is registered.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(
            !sup.is_running("a").await,
            "replacement must not register before the grace period elapses"
        );

        // After the grace period the replacement is live.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.is_running("a").await);

        bus.publish(Message::Command(Command::Halt), &Topic::global());
        assert_eq!(run.await.unwrap().unwrap(), Disposition::Halt);
    }

    #[tokio::test]
    async fn removal_stops_the_syncer_and_clears_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig {
            grace: Duration::from_millis(300),
            data_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let bus = Bus::new(32);
        // Slow engine shutdown: removal must still complete within
        // grace + epsilon.
        let sup = Arc::new(
            Supervisor::new(cfg, bus.clone(), IdleEngine::factory(Duration::from_millis(100)))
                .unwrap(),
        );
        let (feed_tx, feed) = mpsc::channel(4);

        let run_sup = sup.clone();
        let run = tokio::spawn(async move { run_sup.run(vec![task("a")], feed).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Task is mid-activity when the removal arrives.
        bus.publish(Message::Command(Command::Resync), &Topic::for_task("a"));
        feed_tx.send(ConfigEvent::Removed(task("a"))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!sup.is_running("a").await, "handle must be gone after removal");

        bus.publish(Message::Command(Command::Halt), &Topic::global());
        assert_eq!(run.await.unwrap().unwrap(), Disposition::Halt);
    }

    #[tokio::test]
    async fn global_clean_halt_keeps_task_markers_unremoved() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig {
            grace: Duration::from_millis(300),
            data_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let marker = cfg.status_path("a");
        let bus = Bus::new(32);
        let sup = Arc::new(
            Supervisor::new(cfg, bus.clone(), IdleEngine::factory(Duration::ZERO)).unwrap(),
        );
        let (_feed_tx, feed) = mpsc::channel(4);

        let run_sup = sup.clone();
        let run = tokio::spawn(async move { run_sup.run(vec![task("a")], feed).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Give the task a real status, then halt the whole agent cleanly.
        bus.publish(Message::Command(Command::Pause), &Topic::for_task("a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(Message::Command(Command::HaltClean), &Topic::global());
        assert_eq!(run.await.unwrap().unwrap(), Disposition::Halt);

        // An agent-wide stop is not a configuration removal: the marker
        // keeps the last real status.
        assert_eq!(
            crate::store::FileStateStore::recover(&marker),
            Some(crate::store::TaskStatus::Paused)
        );
    }

    #[tokio::test]
    async fn registered_auxiliary_service_stops_with_the_rest() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (sup, bus, _dir) = setup(Duration::from_millis(200));
        let (_feed_tx, feed) = mpsc::channel(4);

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        sup.register_service(
            "janitor",
            ServiceHandle::spawn(|token| async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .await;

        let run_sup = sup.clone();
        let run = tokio::spawn(async move { run_sup.run(vec![], feed).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        bus.publish(Message::Command(Command::Halt), &Topic::global());
        assert_eq!(run.await.unwrap().unwrap(), Disposition::Halt);
        assert!(stopped.load(Ordering::SeqCst), "auxiliary worker must be torn down");
    }

    #[tokio::test]
    async fn failed_update_drops_the_stale_config() {
        let (sup, bus, _dir) = setup(Duration::from_millis(50));
        let (feed_tx, feed) = mpsc::channel(4);

        let mut ticking = task("a");
        ticking.loop_cadence = Some("30ms".to_string());

        let run_sup = sup.clone();
        let run = tokio::spawn(async move { run_sup.run(vec![ticking], feed).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.is_running("a").await);

        let mut broken = task("a");
        broken.right.clear();
        broken.loop_cadence = Some("30ms".to_string());
        feed_tx.send(ConfigEvent::Updated(broken)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!sup.is_running("a").await);

        // The rebuilt scheduler must not keep ticking for the dropped task.
        let mut tap = bus.subscribe(&[Topic::for_task("a")]);
        tokio::time::sleep(Duration::from_millis(120)).await;
        while let Some(msg) = tap.try_recv() {
            assert!(
                !matches!(msg, Message::Command(Command::SyncLoop)),
                "stale ticker still firing for an unregistered task"
            );
        }

        bus.publish(Message::Command(Command::Halt), &Topic::global());
        assert_eq!(run.await.unwrap().unwrap(), Disposition::Halt);
    }

    #[tokio::test]
    async fn created_event_registers_a_new_task() {
        let (sup, bus, _dir) = setup(Duration::from_millis(100));
        let (feed_tx, feed) = mpsc::channel(4);

        let run_sup = sup.clone();
        let run = tokio::spawn(async move { run_sup.run(vec![], feed).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sup.task_ids().await.is_empty());

        feed_tx.send(ConfigEvent::Created(task("b"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.is_running("b").await);

        bus.publish(Message::Command(Command::Restart), &Topic::global());
        assert_eq!(run.await.unwrap().unwrap(), Disposition::Restart);
    }
}
