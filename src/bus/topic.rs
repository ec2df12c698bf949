//! Topic keys partitioning the bus.
//!
//! Fixed topics exist for global commands, the broadcast "all tasks" channel,
//! and state snapshots. Per-task topics are derived deterministically from
//! task identity, so they are stable across restarts as long as the identity
//! is unchanged. Reply topics are uniquely named per request.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// A string key partitioning the [`Bus`](crate::bus::Bus).
///
/// Cheap to clone (`Arc`-backed); compared and hashed by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Global command topic (halt/restart relayed by the supervisor).
    pub fn global() -> Self {
        Topic(Arc::from("global"))
    }

    /// Broadcast topic every syncer listens on.
    pub fn all_tasks() -> Self {
        Topic(Arc::from("tasks:all"))
    }

    /// Topic carrying state snapshots for external observers.
    pub fn state() -> Self {
        Topic(Arc::from("state"))
    }

    /// Per-task topic, derived deterministically from task identity.
    pub fn for_task(id: &str) -> Self {
        Topic(Arc::from(format!("task:{id}").as_str()))
    }

    /// A fresh, uniquely-named reply topic for one request/response exchange.
    pub fn reply() -> Self {
        Topic(Arc::from(format!("reply:{}", Uuid::new_v4()).as_str()))
    }

    /// The raw topic string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
