//! Bounded-wait request/response over the pub/sub bus.
//!
//! A reader in one execution context cannot safely hold a pointer into a
//! service owned by another task; instead it subscribes to a fresh reply
//! topic, publishes a request to the target's topic, and races the first
//! reply against a fixed timeout. A reply arriving after the timeout lands
//! on a dropped subscription and is discarded.

use std::time::Duration;

use crate::bus::{Bus, Message, Topic};

/// Publishes one request and waits up to `timeout` for the first reply that
/// `accept` maps to `Some`.
///
/// `make` receives the freshly derived reply topic and builds the request
/// message carrying it. Returns `None` when nothing is registered on the
/// target topic or the responder does not answer in time; callers should
/// treat this as "unavailable", not as a hard failure.
pub async fn request<T>(
    bus: &Bus,
    target: &Topic,
    timeout: Duration,
    make: impl FnOnce(Topic) -> Message,
    mut accept: impl FnMut(Message) -> Option<T>,
) -> Option<T> {
    let reply = Topic::reply();
    let mut sub = bus.subscribe(&[reply.clone()]);

    bus.publish(make(reply), target);

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let msg = tokio::select! {
            msg = sub.recv() => msg?,
            _ = tokio::time::sleep_until(deadline) => return None,
        };
        if let Some(value) = accept(msg) {
            return Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Command;
    use std::time::Instant;

    #[tokio::test]
    async fn no_responder_times_out_promptly() {
        let bus = Bus::new(8);
        let started = Instant::now();

        let got = request(
            &bus,
            &Topic::for_task("nobody"),
            Duration::from_millis(100),
            |reply| Message::Command(Command::PublishState { reply: Some(reply) }),
            |_msg| Some(()),
        )
        .await;

        assert!(got.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn responder_answer_is_returned() {
        let bus = Bus::new(8);
        let target = Topic::for_task("a");

        // Fake syncer: answers PublishState requests on their reply topic.
        let responder_bus = bus.clone();
        let mut sub = bus.subscribe(&[target.clone()]);
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                if let Message::Command(Command::PublishState { reply: Some(reply) }) = msg {
                    responder_bus.publish(Message::Command(Command::Resume), &reply);
                }
            }
        });

        let got = request(
            &bus,
            &target,
            Duration::from_millis(500),
            |reply| Message::Command(Command::PublishState { reply: Some(reply) }),
            |msg| match msg {
                Message::Command(Command::Resume) => Some(true),
                _ => None,
            },
        )
        .await;

        assert_eq!(got, Some(true));
    }

    #[tokio::test]
    async fn non_matching_replies_are_skipped() {
        let bus = Bus::new(8);
        let target = Topic::for_task("a");

        let responder_bus = bus.clone();
        let mut sub = bus.subscribe(&[target.clone()]);
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                if let Message::Command(Command::PublishState { reply: Some(reply) }) = msg {
                    responder_bus.publish(Message::Command(Command::Pause), &reply);
                    responder_bus.publish(Message::Command(Command::Resume), &reply);
                }
            }
        });

        let got = request(
            &bus,
            &target,
            Duration::from_millis(500),
            |reply| Message::Command(Command::PublishState { reply: Some(reply) }),
            |msg| match msg {
                Message::Command(Command::Resume) => Some("second"),
                _ => None,
            },
        )
        .await;

        assert_eq!(got, Some("second"));
    }
}
