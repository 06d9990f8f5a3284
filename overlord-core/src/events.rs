//! Event bus & monitor (`SPEC_FULL.md`, `[EVENT-BUS]`; spec.md §4.6).
//!
//! Topics are strings: well-known lifecycle names (`agent joined`,
//! `agent left`, `agent properties`) and per-session topics keyed by
//! `session_id`. Publish is best-effort and bounded per subscriber
//! (spec.md §9: "disconnect on buffer full").

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::mpsc;

pub const TOPIC_AGENT_JOINED: &str = "agent joined";
pub const TOPIC_AGENT_LEFT: &str = "agent left";
pub const TOPIC_AGENT_PROPERTIES: &str = "agent properties";

pub type SubscriberId = u64;

/// Wire shape of a published event: `{"event": name, "data": [json_string,
/// ...]}`, each `data` entry itself JSON-encoded (spec.md §9, preserved for
/// dashboard wire compatibility).
#[derive(Serialize, Debug, Clone)]
pub struct Event {
    pub event: String,
    pub data: Vec<String>,
}

impl Event {
    pub fn new(event: impl Into<String>, payload: &impl Serialize) -> Self {
        let encoded = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
        Self {
            event: event.into(),
            data: vec![encoded],
        }
    }

    pub fn bare(event: impl Into<String>, data: Vec<String>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Topic → subscriber-id index, plus the subscriber-id → sender map,
/// guarded per-key by `DashMap`'s sharded locking (spec.md §5: exclusive
/// lock on mutation, snapshot on publish).
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<SubscriberId, mpsc::Sender<Event>>,
    topics: DashMap<String, DashSet<SubscriberId>>,
    next_id: AtomicU64,
    buffer_depth: usize,
}

impl EventBus {
    pub fn new(buffer_depth: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer_depth,
        }
    }

    /// Register a new subscriber with no topics yet; returns its id and the
    /// receiving end of its bounded event channel.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_depth);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    /// Subscribe `id` to `topic`.
    pub fn subscribe(&self, id: SubscriberId, topic: &str) {
        self.topics.entry(topic.to_string()).or_default().insert(id);
    }

    pub fn unsubscribe(&self, id: SubscriberId, topic: &str) {
        if let Some(set) = self.topics.get(topic) {
            set.remove(&id);
        }
    }

    /// Remove a subscriber from every topic it holds (socket closed).
    pub fn remove_subscriber(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
        for topic in self.topics.iter() {
            topic.value().remove(&id);
        }
    }

    /// Best-effort publish to every subscriber of `topic`. A subscriber
    /// whose channel is full is evicted from every topic (spec.md §9).
    pub fn publish(&self, topic: &str, event: Event) {
        let Some(ids) = self.topics.get(topic) else {
            return;
        };
        let ids: Vec<SubscriberId> = ids.iter().map(|r| *r).collect();

        let mut full = Vec::new();
        for id in ids {
            if let Some(tx) = self.subscribers.get(&id) {
                if tx.try_send(event.clone()).is_err() {
                    full.push(id);
                }
            }
        }
        for id in full {
            self.remove_subscriber(id);
        }
    }

    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_unsubscribe_leaves_index_unchanged() {
        let bus = EventBus::new(8);
        let (id, _rx) = bus.register();
        bus.subscribe(id, "agent joined");
        assert_eq!(bus.topic_subscriber_count("agent joined"), 1);
        bus.unsubscribe(id, "agent joined");
        assert_eq!(bus.topic_subscriber_count("agent joined"), 0);
    }

    #[tokio::test]
    async fn publish_delivers_to_subscribed_topic_only() {
        let bus = EventBus::new(8);
        let (id, mut rx) = bus.register();
        bus.subscribe(id, "agent joined");

        bus.publish("agent joined", Event::new("agent joined", &serde_json::json!({"mid":"m1"})));
        bus.publish("agent left", Event::new("agent left", &serde_json::json!({"mid":"m1"})));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event, "agent joined");
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_on_full_buffer() {
        let bus = EventBus::new(1);
        let (id, _rx) = bus.register();
        bus.subscribe(id, "t");

        bus.publish("t", Event::new("a", &serde_json::json!({})));
        // channel now full (capacity 1, nothing consumed yet)
        bus.publish("t", Event::new("b", &serde_json::json!({})));

        assert_eq!(bus.topic_subscriber_count("t"), 0);
    }
}
