//! Fan-out bus between the mirror-side producers and connected clients.
//! Producers never block: each subscriber owns a bounded queue and the
//! oldest frame of the same topic is dropped (and counted) when it fills.
//! Correctness survives drops because topology frames are full snapshots
//! and change records can be replayed via `?since=`.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use vantage_core::ViewMode;

fn queue_capacity() -> usize {
    std::env::var("VANTAGE_SUB_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(64)
}

const HEARTBEAT_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Topology,
    Change,
    RawEvent,
    ContextProgress,
    Heartbeat,
}

/// Subscription identity: one per connected stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub view: ViewMode,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: Topic,
    /// Wire-level event name; `context_changed` rides the context-progress
    /// topic under its own name.
    pub event: &'static str,
    pub payload: Arc<Value>,
}

struct SubscriberInner {
    id: u64,
    key: SubKey,
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberInner {
    fn enqueue(&self, frame: Frame, cap: usize) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= cap {
            // Drop the oldest frame of the same topic; fall back to the
            // global oldest so the queue never grows past its bound.
            let topic = frame.topic;
            let victim = queue
                .iter()
                .position(|f| f.topic == topic)
                .unwrap_or(0);
            queue.remove(victim);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("bus_frames_dropped_total", 1u64);
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Client-held end of a subscription. Dropping it unregisters.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
    bus: Arc<EventBus>,
}

impl Subscription {
    /// Next frame, or `None` once the bus shut the subscription down.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the checks so a notify landing in between
            // cannot be lost.
            notified.as_mut().enable();
            if let Some(frame) = self.inner.queue.lock().unwrap().pop_front() {
                return Some(frame);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn key(&self) -> &SubKey {
        &self.inner.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.inner.id);
    }
}

pub struct EventBus {
    subscribers: ArcSwap<Vec<Arc<SubscriberInner>>>,
    next_id: AtomicU64,
    capacity: usize,
    topology_paused: AtomicBool,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: queue_capacity(),
            topology_paused: AtomicBool::new(false),
        })
    }

    /// Spawn the heartbeat ticker. Frames carry a trivial `{ts}` payload so
    /// idle proxies keep the stream open.
    pub fn start_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let payload = Arc::new(serde_json::json!({
                    "ts": chrono::Utc::now().timestamp(),
                }));
                for sub in bus.subscribers.load().iter() {
                    sub.enqueue(
                        Frame {
                            topic: Topic::Heartbeat,
                            event: "heartbeat",
                            payload: Arc::clone(&payload),
                        },
                        bus.capacity,
                    );
                }
            }
        })
    }

    pub fn subscribe(self: &Arc<Self>, key: SubKey) -> Subscription {
        let inner = Arc::new(SubscriberInner {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            key,
            queue: Mutex::new(VecDeque::with_capacity(self.capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.rcu(|subs| {
            let mut next = Vec::with_capacity(subs.len() + 1);
            next.extend(subs.iter().cloned());
            next.push(Arc::clone(&inner));
            next
        });
        debug!(id = inner.id, "subscriber registered");
        Subscription {
            inner,
            bus: Arc::clone(self),
        }
    }

    fn unregister(&self, id: u64) {
        self.subscribers.rcu(|subs| {
            subs.iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        debug!(id, "subscriber unregistered");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().len()
    }

    /// Close every live subscription; readers drain their queues and then
    /// see the end of stream.
    pub fn shutdown(&self) {
        for sub in self.subscribers.load().iter() {
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_waiters();
        }
    }

    /// Aggregate dropped-frame count across live subscribers.
    pub fn total_drops(&self) -> u64 {
        self.subscribers
            .load()
            .iter()
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }

    /// Hold back topology frames while a context switch re-primes the
    /// mirrors.
    pub fn pause_topology(&self) {
        self.topology_paused.store(true, Ordering::Release);
    }

    pub fn resume_topology(&self) {
        self.topology_paused.store(false, Ordering::Release);
    }

    /// Topology snapshots go only to the subscription they were built for.
    pub fn publish_topology(&self, key: &SubKey, payload: Value) {
        if self.topology_paused.load(Ordering::Acquire) {
            return;
        }
        let payload = Arc::new(payload);
        for sub in self.subscribers.load().iter() {
            if &sub.key == key {
                sub.enqueue(
                    Frame {
                        topic: Topic::Topology,
                        event: "topology",
                        payload: Arc::clone(&payload),
                    },
                    self.capacity,
                );
            }
        }
    }

    pub fn publish_change(&self, namespace: Option<&str>, payload: Value) {
        self.fan_out(Topic::Change, "change", namespace, payload);
    }

    pub fn publish_raw_event(&self, namespace: Option<&str>, payload: Value) {
        self.fan_out(Topic::RawEvent, "raw_event", namespace, payload);
    }

    pub fn publish_progress(&self, phase: &str) {
        self.fan_out(
            Topic::ContextProgress,
            "context_progress",
            None,
            serde_json::json!({ "phase": phase }),
        );
    }

    pub fn publish_context_changed(&self, context: &str) {
        self.fan_out(
            Topic::ContextProgress,
            "context_changed",
            None,
            serde_json::json!({ "context": context }),
        );
    }

    /// Namespace-filtered fan-out: cluster-scoped payloads reach everyone,
    /// namespaced ones reach unfiltered subscribers and matching filters.
    fn fan_out(&self, topic: Topic, event: &'static str, namespace: Option<&str>, payload: Value) {
        let payload = Arc::new(payload);
        for sub in self.subscribers.load().iter() {
            let wanted = match (sub.key.namespace.as_deref(), namespace) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(filter), Some(ns)) => filter == ns,
            };
            if wanted {
                sub.enqueue(
                    Frame {
                        topic,
                        event,
                        payload: Arc::clone(&payload),
                    },
                    self.capacity,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(ns: Option<&str>) -> SubKey {
        SubKey {
            view: ViewMode::Resources,
            namespace: ns.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_bounded_and_counted_while_fast_one_sees_all() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe(key(None));
        let mut fast = bus.subscribe(key(None));

        let mut fast_seen = 0u64;
        for i in 0..10_000u64 {
            bus.publish_change(None, json!({ "id": i }));
            while fast.try_recv().is_some() {
                fast_seen += 1;
            }
        }
        assert_eq!(fast_seen, 10_000);
        assert_eq!(fast.dropped(), 0);

        let queued = slow.inner.queue.lock().unwrap().len();
        assert!(queued <= 64, "slow queue bounded, got {}", queued);
        assert_eq!(slow.dropped(), 10_000 - queued as u64);
        assert!(bus.total_drops() >= slow.dropped());

        // The retained frames are the newest ones.
        let first = slow.try_recv().unwrap();
        assert_eq!(first.payload["id"], json!(10_000 - queued as u64));
    }

    #[tokio::test]
    async fn topology_routes_by_subscription_key() {
        let bus = EventBus::new();
        let mut res_a = bus.subscribe(SubKey {
            view: ViewMode::Resources,
            namespace: Some("a".into()),
        });
        let mut traffic_a = bus.subscribe(SubKey {
            view: ViewMode::Traffic,
            namespace: Some("a".into()),
        });

        bus.publish_topology(res_a.key(), json!({"generation": 1}));
        assert!(res_a.try_recv().is_some());
        assert!(traffic_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn changes_respect_namespace_filters() {
        let bus = EventBus::new();
        let mut all = bus.subscribe(key(None));
        let mut only_a = bus.subscribe(key(Some("a")));

        bus.publish_change(Some("a"), json!({"n": 1}));
        bus.publish_change(Some("b"), json!({"n": 2}));
        bus.publish_change(None, json!({"n": 3}));

        let mut all_seen = 0;
        while all.try_recv().is_some() {
            all_seen += 1;
        }
        assert_eq!(all_seen, 3);

        let mut a_seen = Vec::new();
        while let Some(f) = only_a.try_recv() {
            a_seen.push(f.payload["n"].as_i64().unwrap());
        }
        // Namespace "b" traffic is invisible; cluster-scoped passes through.
        assert_eq!(a_seen, vec![1, 3]);
    }

    #[tokio::test]
    async fn paused_topology_is_held_back() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(key(None));
        bus.pause_topology();
        bus.publish_topology(sub.key(), json!({"generation": 1}));
        assert!(sub.try_recv().is_none());
        bus.resume_topology();
        let sub_key = sub.key().clone();
        bus.publish_topology(&sub_key, json!({"generation": 2}));
        assert_eq!(sub.try_recv().unwrap().payload["generation"], json!(2));
    }

    #[tokio::test]
    async fn context_changed_rides_progress_topic_with_own_event_name() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(key(Some("a")));
        bus.publish_progress("tearing down watchers");
        bus.publish_context_changed("staging");
        let p = sub.try_recv().unwrap();
        assert_eq!(p.event, "context_progress");
        let c = sub.try_recv().unwrap();
        assert_eq!(c.event, "context_changed");
        assert_eq!(c.topic, Topic::ContextProgress);
        assert_eq!(c.payload["context"], json!("staging"));
    }

    #[tokio::test]
    async fn drop_prefers_same_topic_victim() {
        std::env::remove_var("VANTAGE_SUB_QUEUE_CAP");
        let bus = EventBus::new();
        let mut sub = bus.subscribe(key(None));
        // One progress frame, then enough change frames to overflow.
        bus.publish_progress("phase-1");
        for i in 0..70 {
            bus.publish_change(None, json!({ "i": i }));
        }
        // The progress frame survived; change frames were the victims.
        let first = sub.try_recv().unwrap();
        assert_eq!(first.topic, Topic::ContextProgress);
    }

    #[tokio::test]
    async fn unregister_on_drop() {
        let bus = EventBus::new();
        let sub = bus.subscribe(key(None));
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_streams_after_drain() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(key(None));
        bus.publish_change(None, json!({"n": 1}));
        bus.shutdown();
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
