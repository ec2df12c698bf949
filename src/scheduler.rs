//! # Scheduler: timed triggers for every configured task.
//!
//! A single scheduler holds all task configs. For every task with an
//! incremental cadence it runs an independent periodic trigger publishing
//! [`Command::SyncLoop`] to that task's topic; a full-resync cadence gets a
//! second trigger publishing [`Command::Resync`]. A task may have zero, one,
//! or both.
//!
//! Cadence expressions are parsed once at start; an expression that fails to
//! parse is logged and skipped, never aborting scheduling for other tasks.
//!
//! The supervisor discards and recreates the scheduler on every task
//! mutation, so the ticker set always matches the current configuration.
//! [`Scheduler::run`] returns only after every ticker has been joined, so no
//! trigger fires after the stop completes.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Command, Message, Topic};
use crate::config::TaskConfig;

/// Publishes timed `SyncLoop`/`Resync` triggers onto per-task topics.
pub struct Scheduler {
    bus: Bus,
    tasks: Vec<TaskConfig>,
}

impl Scheduler {
    /// Creates a scheduler over a snapshot of all task configs.
    pub fn new(bus: Bus, tasks: Vec<TaskConfig>) -> Self {
        Self { bus, tasks }
    }

    /// Starts one ticker per parseable cadence and blocks until cancelled;
    /// returns only after all tickers are confirmed stopped.
    pub async fn run(self, token: CancellationToken) {
        let mut set = JoinSet::new();

        for task in &self.tasks {
            if let Some(period) = parse_cadence(&task.id, "loop", task.loop_cadence.as_deref()) {
                set.spawn(tick_loop(
                    self.bus.clone(),
                    Topic::for_task(&task.id),
                    Command::SyncLoop,
                    period,
                    token.child_token(),
                ));
            }
            if let Some(period) = parse_cadence(&task.id, "resync", task.resync_cadence.as_deref())
            {
                set.spawn(tick_loop(
                    self.bus.clone(),
                    Topic::for_task(&task.id),
                    Command::Resync,
                    period,
                    token.child_token(),
                ));
            }
        }

        info!(tickers = set.len(), "scheduler started");
        token.cancelled().await;
        while set.join_next().await.is_some() {}
        debug!("scheduler stopped; all tickers joined");
    }
}

/// Parses one cadence expression; `None` means "not configured or skipped".
fn parse_cadence(task: &str, kind: &str, expr: Option<&str>) -> Option<Duration> {
    let expr = expr?;
    match humantime::parse_duration(expr) {
        Ok(period) if period.is_zero() => {
            warn!(task = %task, kind = %kind, cadence = %expr, "skipping zero-length cadence");
            None
        }
        Ok(period) => Some(period),
        Err(e) => {
            warn!(task = %task, kind = %kind, cadence = %expr, error = %e, "skipping unparseable cadence");
            None
        }
    }
}

async fn tick_loop(bus: Bus, topic: Topic, cmd: Command, period: Duration, token: CancellationToken) {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                bus.publish(Message::Command(cmd.clone()), &topic);
            }
        }
    }
}
