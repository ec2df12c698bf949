//! # Topic-partitioned publish/subscribe bus.
//!
//! In-process fan-out messaging used both for fire-and-forget command
//! dispatch and as the substrate for the synchronous request/response idiom
//! in [`request`].
//!
//! ## Rules
//! - **Fan-out, not competing consumers**: every subscriber to a topic gets
//!   its own copy of each message.
//! - **Non-blocking publish**: delivery uses bounded per-subscriber queues
//!   and `try_send`; a subscriber that stops draining risks missing
//!   messages, but never stalls unrelated publishers.
//! - **Per-topic FIFO**: one subscriber observes one topic's publishes in
//!   publish order. No ordering across topics.
//! - **Not a durable log**: messages published with no subscriber are gone.
//!
//! ## Diagram
//! ```text
//!   publish(msg, "task:a")
//!        │
//!        ├──► [queue S1] ─► Subscription::recv()     (subscribed to task:a)
//!        └──► [queue S2] ─► Subscription::recv()     (subscribed to task:a, tasks:all)
//! ```

mod message;
mod request;
mod topic;

pub use message::{Command, Message, ProgressEvent};
pub use request::request;
pub use topic::Topic;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// One subscriber's entry in a topic's delivery list.
struct Outlet {
    id: u64,
    tx: mpsc::Sender<Message>,
}

/// Topic-partitioned fan-out bus.
///
/// Cheap to clone; all clones share the same subscriber registry. The
/// registry is an explicit owned structure behind a mutex, never ambient
/// package state.
#[derive(Clone)]
pub struct Bus {
    capacity: usize,
    topics: Arc<Mutex<HashMap<Topic, Vec<Outlet>>>>,
    next_id: Arc<AtomicU64>,
}

/// A live subscription returned by [`Bus::subscribe`].
///
/// Dropping the subscription unsubscribes from all its topics; deliveries
/// already queued are not revoked.
pub struct Subscription {
    id: u64,
    topics: Vec<Topic>,
    rx: mpsc::Receiver<Message>,
    bus: Bus,
}

impl Bus {
    /// Creates a bus whose subscribers each get a queue of `capacity`
    /// messages per subscription (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribes to every message published to any of `topics` from this
    /// point forward.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut map = self.topics.lock();
        for topic in topics {
            map.entry(topic.clone()).or_default().push(Outlet {
                id,
                tx: tx.clone(),
            });
        }

        Subscription {
            id,
            topics: topics.to_vec(),
            rx,
            bus: self.clone(),
        }
    }

    /// Delivers `msg` to every current subscriber of `topic`.
    ///
    /// A subscriber whose queue is full misses this message (debug-logged);
    /// closed subscribers are pruned.
    pub fn publish(&self, msg: Message, topic: &Topic) {
        let mut map = self.topics.lock();
        let Some(outlets) = map.get_mut(topic) else {
            return;
        };

        outlets.retain(|outlet| match outlet.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(topic = %topic, subscriber = outlet.id, "dropping message: queue full");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if outlets.is_empty() {
            map.remove(topic);
        }
    }

    /// Stops future delivery to `sub` for the given topics.
    pub fn unsubscribe(&self, sub: &Subscription, topics: &[Topic]) {
        self.remove_subscriber(sub.id, topics);
    }

    fn remove_subscriber(&self, id: u64, topics: &[Topic]) {
        let mut map = self.topics.lock();
        for topic in topics {
            if let Some(outlets) = map.get_mut(topic) {
                outlets.retain(|o| o.id != id);
                if outlets.is_empty() {
                    map.remove(topic);
                }
            }
        }
    }
}

impl Subscription {
    /// Receives the next message, in publish order per topic.
    ///
    /// Returns `None` once unsubscribed from every topic and the queue has
    /// drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking receive for callers polling from a select loop.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let topics = std::mem::take(&mut self.topics);
        self.bus.remove_subscriber(self.id, &topics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(c: Command) -> Message {
        Message::Command(c)
    }

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy() {
        let bus = Bus::new(8);
        let topic = Topic::for_task("a");
        let mut s1 = bus.subscribe(&[topic.clone()]);
        let mut s2 = bus.subscribe(&[topic.clone()]);

        bus.publish(cmd(Command::SyncLoop), &topic);

        assert!(matches!(s1.recv().await, Some(Message::Command(Command::SyncLoop))));
        assert!(matches!(s2.recv().await, Some(Message::Command(Command::SyncLoop))));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = Bus::new(8);
        let mut sub = bus.subscribe(&[Topic::for_task("a")]);

        bus.publish(cmd(Command::Pause), &Topic::for_task("b"));
        bus.publish(cmd(Command::Resume), &Topic::for_task("a"));

        assert!(matches!(sub.recv().await, Some(Message::Command(Command::Resume))));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_topic() {
        let bus = Bus::new(8);
        let topic = Topic::for_task("a");
        let mut sub = bus.subscribe(&[topic.clone()]);

        bus.publish(cmd(Command::Pause), &topic);
        bus.publish(cmd(Command::Resume), &topic);
        bus.publish(cmd(Command::SyncLoop), &topic);

        assert!(matches!(sub.recv().await, Some(Message::Command(Command::Pause))));
        assert!(matches!(sub.recv().await, Some(Message::Command(Command::Resume))));
        assert!(matches!(sub.recv().await, Some(Message::Command(Command::SyncLoop))));
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery() {
        let bus = Bus::new(8);
        let topic = Topic::for_task("a");
        let mut sub = bus.subscribe(&[topic.clone()]);

        bus.unsubscribe(&sub, &[topic.clone()]);
        bus.publish(cmd(Command::SyncLoop), &topic);

        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publishers() {
        let bus = Bus::new(1);
        let topic = Topic::for_task("a");
        let mut sub = bus.subscribe(&[topic.clone()]);

        // Second publish overflows the queue and is dropped, not blocked on.
        bus.publish(cmd(Command::Pause), &topic);
        bus.publish(cmd(Command::Resume), &topic);

        assert!(matches!(sub.recv().await, Some(Message::Command(Command::Pause))));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = Bus::new(8);
        let topic = Topic::for_task("a");
        let sub = bus.subscribe(&[topic.clone()]);
        drop(sub);

        // Publishing to a topic with only dead outlets must not panic and
        // must clean the registry.
        bus.publish(cmd(Command::SyncLoop), &topic);
        assert!(bus.topics.lock().get(&topic).is_none());
    }
}
