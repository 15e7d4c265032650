//! Typed in-process publish/subscribe.
//!
//! Every subscription owns a bounded queue and a dispatch task; ordering
//! is FIFO per (sender, type, subscriber) and nothing is guaranteed
//! across subscribers. `Reliable` publications wait (bounded) for queue
//! space; `Fast` and `Broadcast` drop the oldest queued item instead.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use plugrid_core::{PluginError, PluginResult};

use crate::message::{DeliveryMode, Message};

/// Predicate applied to a message before delivery to one subscription.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Subscription handler. Invoked on a blocking thread, one message at a
/// time per subscription; blocking inside a handler is allowed.
pub type MessageHandler = Arc<dyn Fn(&Message) -> PluginResult<()> + Send + Sync>;

/// Handle to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Bus tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscription queue bound.
    pub queue_capacity: usize,
    /// How long a `Reliable` publication waits for queue space.
    #[serde(with = "wait_ms")]
    pub publish_wait: Duration,
    /// Remove a subscription after this many handler failures.
    /// Disabled by default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            publish_wait: Duration::from_secs(1),
            failure_threshold: None,
        }
    }
}

mod wait_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStatistics {
    /// Messages accepted by `publish`.
    pub total_messages: u64,
    /// Messages discarded under `Fast`/`Broadcast` backpressure.
    pub dropped_messages: u64,
    /// Handler invocations that failed or panicked.
    pub handler_failures: u64,
    /// Live subscriptions.
    pub active_subscriptions: usize,
    /// Publications per message type.
    pub per_type: BTreeMap<String, u64>,
}

struct SubscriptionEntry {
    id: SubscriptionId,
    subscriber: String,
    message_type: String,
    filter: Option<MessageFilter>,
    handler: MessageHandler,
    queue: Mutex<VecDeque<Message>>,
    arrival: Notify,
    space: Notify,
    failures: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct BusInner {
    subscriptions: DashMap<SubscriptionId, Arc<SubscriptionEntry>>,
    config: BusConfig,
    total_messages: AtomicU64,
    dropped_messages: AtomicU64,
    handler_failures: AtomicU64,
    per_type: DashMap<String, u64>,
}

impl BusInner {
    fn remove(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, entry)) => {
                if let Some(task) = lock(&entry.task).take() {
                    task.abort();
                }
                true
            },
            None => false,
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            if let Some(task) = lock(&entry.task).take() {
                task.abort();
            }
        }
    }
}

/// The message bus. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// A bus with default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// A bus with explicit tunables.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: DashMap::new(),
                config,
                total_messages: AtomicU64::new(0),
                dropped_messages: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
                per_type: DashMap::new(),
            }),
        }
    }

    /// Subscribe a handler to one message type, with an optional filter.
    ///
    /// A subscriber may hold any number of subscriptions. Must be called
    /// within a tokio runtime; the subscription's dispatch task is
    /// spawned here.
    pub fn subscribe(
        &self,
        subscriber: impl Into<String>,
        message_type: impl Into<String>,
        filter: Option<MessageFilter>,
        handler: MessageHandler,
    ) -> PluginResult<SubscriptionId> {
        let subscriber = subscriber.into();
        let message_type = message_type.into();
        if subscriber.is_empty() {
            return Err(PluginError::invalid_argument("empty subscriber id"));
        }
        if message_type.is_empty() {
            return Err(PluginError::invalid_argument("empty message type"));
        }

        let id = SubscriptionId::new();
        let entry = Arc::new(SubscriptionEntry {
            id,
            subscriber: subscriber.clone(),
            message_type: message_type.clone(),
            filter,
            handler,
            queue: Mutex::new(VecDeque::new()),
            arrival: Notify::new(),
            space: Notify::new(),
            failures: AtomicU32::new(0),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(dispatch_loop(
            Arc::clone(&entry),
            Arc::downgrade(&self.inner),
        ));
        *lock(&entry.task) = Some(task);
        self.inner.subscriptions.insert(id, entry);
        debug!(%subscriber, %message_type, subscription = %id, "Subscribed");
        Ok(id)
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            debug!(subscription = %id, "Unsubscribed");
        }
        removed
    }

    /// Remove every subscription held by a subscriber. Returns how many.
    pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let ids: Vec<SubscriptionId> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| entry.subscriber == subscriber)
            .map(|entry| entry.id)
            .collect();
        let mut removed = 0;
        for id in ids {
            if self.inner.remove(id) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(%subscriber, removed, "Unsubscribed all");
        }
        removed
    }

    /// Distinct subscriber ids listening to a message type, sorted.
    #[must_use]
    pub fn subscribers(&self, message_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| entry.message_type == message_type)
            .map(|entry| entry.subscriber.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Publish a message.
    ///
    /// `Reliable` waits up to `publish_wait` per full subscriber queue and
    /// fails with `Timeout` naming the slow subscriber; the message is
    /// still delivered to every other subscriber. `Fast` and `Broadcast`
    /// never wait; they drop the oldest queued item instead. `Broadcast`
    /// ignores subscription filters.
    pub async fn publish(&self, message: Message, mode: DeliveryMode) -> PluginResult<()> {
        self.inner.total_messages.fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .per_type
            .entry(message.message_type.clone())
            .or_insert(0) += 1;

        let targets: Vec<Arc<SubscriptionEntry>> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| entry.message_type == message.message_type)
            .filter(|entry| {
                mode == DeliveryMode::Broadcast
                    || entry.filter.as_ref().is_none_or(|accept| accept(&message))
            })
            .map(|entry| Arc::clone(&entry))
            .collect();

        let mut slow: Option<String> = None;
        for entry in targets {
            match mode {
                DeliveryMode::Reliable => {
                    if self.enqueue_bounded(&entry, &message).await.is_err() {
                        warn!(
                            subscriber = %entry.subscriber,
                            message_type = %message.message_type,
                            "Subscriber queue full past the publish wait"
                        );
                        slow.get_or_insert_with(|| entry.subscriber.clone());
                    }
                },
                DeliveryMode::Fast | DeliveryMode::Broadcast => {
                    self.enqueue_dropping(&entry, &message);
                },
            }
        }

        match slow {
            Some(subscriber) => Err(PluginError::timeout(format!(
                "queue of subscriber {subscriber} stayed full"
            ))),
            None => Ok(()),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn statistics(&self) -> BusStatistics {
        BusStatistics {
            total_messages: self.inner.total_messages.load(Ordering::Relaxed),
            dropped_messages: self.inner.dropped_messages.load(Ordering::Relaxed),
            handler_failures: self.inner.handler_failures.load(Ordering::Relaxed),
            active_subscriptions: self.inner.subscriptions.len(),
            per_type: self
                .inner
                .per_type
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }

    /// Zero all counters. Subscriptions are untouched.
    pub fn reset_statistics(&self) {
        self.inner.total_messages.store(0, Ordering::Relaxed);
        self.inner.dropped_messages.store(0, Ordering::Relaxed);
        self.inner.handler_failures.store(0, Ordering::Relaxed);
        self.inner.per_type.clear();
    }

    async fn enqueue_bounded(
        &self,
        entry: &Arc<SubscriptionEntry>,
        message: &Message,
    ) -> PluginResult<()> {
        let deadline = Instant::now() + self.inner.config.publish_wait;
        loop {
            let pushed = {
                let mut queue = lock(&entry.queue);
                if queue.len() < self.inner.config.queue_capacity {
                    queue.push_back(message.clone());
                    true
                } else {
                    false
                }
            };
            if pushed {
                entry.arrival.notify_one();
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PluginError::timeout("no queue space"));
            }
            if tokio::time::timeout(remaining, entry.space.notified())
                .await
                .is_err()
            {
                return Err(PluginError::timeout("no queue space"));
            }
        }
    }

    fn enqueue_dropping(&self, entry: &Arc<SubscriptionEntry>, message: &Message) {
        {
            let mut queue = lock(&entry.queue);
            if queue.len() >= self.inner.config.queue_capacity {
                queue.pop_front();
                self.inner.dropped_messages.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message.clone());
        }
        entry.arrival.notify_one();
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish_non_exhaustive()
    }
}

async fn dispatch_loop(entry: Arc<SubscriptionEntry>, bus: Weak<BusInner>) {
    loop {
        let message = loop {
            let popped = lock(&entry.queue).pop_front();
            match popped {
                Some(message) => break message,
                None => entry.arrival.notified().await,
            }
        };
        entry.space.notify_one();

        // Handlers may block; run them off the runtime workers so the
        // time driver (and with it the publish wait) keeps making
        // progress. A panic surfaces as a join error and counts as a
        // handler failure.
        let handler = Arc::clone(&entry.handler);
        let outcome = tokio::task::spawn_blocking(move || handler(&message)).await;
        if matches!(outcome, Ok(Ok(()))) {
            continue;
        }
        warn!(
            subscriber = %entry.subscriber,
            message_type = %entry.message_type,
            "Message handler failed"
        );
        let Some(bus) = bus.upgrade() else { return };
        bus.handler_failures.fetch_add(1, Ordering::Relaxed);
        let failures = entry.failures.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if let Some(threshold) = bus.config.failure_threshold {
            if failures >= threshold {
                info!(
                    subscriber = %entry.subscriber,
                    failures,
                    "Removing subscription after repeated handler failures"
                );
                bus.remove(entry.id);
                return;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    fn sink() -> (MessageHandler, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |message: &Message| {
            store.lock().unwrap().push(message.clone());
            Ok(())
        });
        (handler, seen)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn priority_filter_sees_high_and_critical_in_order() {
        let bus = MessageBus::new();
        let (handler, seen) = sink();
        let rank = |message: &Message| {
            match message.payload["priority"].as_str() {
                Some("low") => 0,
                Some("normal") => 1,
                Some("high") => 2,
                Some("critical") => 3,
                _ => 0,
            }
        };
        let filter: MessageFilter = Arc::new(move |message| rank(message) >= 2);
        bus.subscribe("watcher", "system_event", Some(filter), handler)
            .unwrap();

        for priority in ["low", "normal", "high", "critical"] {
            bus.publish(
                Message::new("system_event", "kernel", json!({ "priority": priority })),
                DeliveryMode::Reliable,
            )
            .await
            .unwrap();
        }

        wait_until(|| seen.lock().unwrap().len() == 2).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].payload["priority"], json!("high"));
        assert_eq!(seen[1].payload["priority"], json!("critical"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fifo_per_subscriber() {
        let bus = MessageBus::new();
        let (handler, seen) = sink();
        bus.subscribe("s", "tick", None, handler).unwrap();

        for n in 0..20 {
            bus.publish(
                Message::new("tick", "clock", json!({ "n": n })),
                DeliveryMode::Reliable,
            )
            .await
            .unwrap();
        }

        wait_until(|| seen.lock().unwrap().len() == 20).await;
        let seen = seen.lock().unwrap();
        for (expected, message) in seen.iter().enumerate() {
            assert_eq!(message.payload["n"], json!(expected));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fast_mode_drops_oldest_under_backpressure() {
        let bus = MessageBus::with_config(BusConfig {
            queue_capacity: 2,
            ..BusConfig::default()
        });

        // The handler parks on the gate so the queue backs up
        // deterministically.
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |message: &Message| {
            started_tx.send(()).ok();
            release_rx.lock().unwrap().recv().ok();
            store.lock().unwrap().push(message.payload["n"].clone());
            Ok(())
        });
        bus.subscribe("slow", "burst", None, handler).unwrap();

        bus.publish(Message::new("burst", "p", json!({ "n": 0 })), DeliveryMode::Fast)
            .await
            .unwrap();
        started_rx.recv().unwrap(); // message 0 is in the handler

        for n in 1..=3 {
            bus.publish(Message::new("burst", "p", json!({ "n": n })), DeliveryMode::Fast)
                .await
                .unwrap();
        }
        // Queue held {1, 2}; publishing 3 dropped 1.
        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }

        wait_until(|| seen.lock().unwrap().len() == 3).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(2), json!(3)]);
        assert_eq!(bus.statistics().dropped_messages, 1);
    }

    // A single worker thread: if the parked handler ran on the runtime
    // worker instead of a blocking thread, the publish wait could never
    // fire and this test would hang.
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn reliable_mode_times_out_when_queue_stays_full() {
        let bus = MessageBus::with_config(BusConfig {
            queue_capacity: 1,
            publish_wait: Duration::from_millis(100),
            ..BusConfig::default()
        });

        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let handler: MessageHandler = Arc::new(move |_: &Message| {
            started_tx.send(()).ok();
            release_rx.lock().unwrap().recv().ok();
            Ok(())
        });
        bus.subscribe("slow", "job", None, handler).unwrap();

        bus.publish(Message::new("job", "p", json!(1)), DeliveryMode::Reliable)
            .await
            .unwrap();
        started_rx.recv().unwrap();
        bus.publish(Message::new("job", "p", json!(2)), DeliveryMode::Reliable)
            .await
            .unwrap(); // fills the queue

        let err = bus
            .publish(Message::new("job", "p", json!(3)), DeliveryMode::Reliable)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), plugrid_core::ErrorKind::Timeout);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broadcast_ignores_filters() {
        let bus = MessageBus::new();
        let (handler, seen) = sink();
        let reject_all: MessageFilter = Arc::new(|_| false);
        bus.subscribe("s", "alert", Some(reject_all), handler).unwrap();

        bus.publish(Message::new("alert", "p", json!({})), DeliveryMode::Fast)
            .await
            .unwrap();
        bus.publish(Message::new("alert", "p", json!({})), DeliveryMode::Broadcast)
            .await
            .unwrap();

        wait_until(|| seen.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1, "only the broadcast got through");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsubscribe_variants() {
        let bus = MessageBus::new();
        let (handler, _) = sink();
        let a = bus
            .subscribe("alice", "t1", None, Arc::clone(&handler))
            .unwrap();
        bus.subscribe("alice", "t2", None, Arc::clone(&handler)).unwrap();
        bus.subscribe("bob", "t1", None, handler).unwrap();

        assert_eq!(bus.subscribers("t1"), vec!["alice", "bob"]);
        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        assert_eq!(bus.unsubscribe_all("alice"), 1);
        assert_eq!(bus.subscribers("t1"), vec!["bob"]);
        assert_eq!(bus.statistics().active_subscriptions, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_ids_rejected() {
        let bus = MessageBus::new();
        let (handler, _) = sink();
        assert!(bus.subscribe("", "t", None, Arc::clone(&handler)).is_err());
        assert!(bus.subscribe("s", "", None, handler).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_handler_is_removed_past_threshold() {
        let bus = MessageBus::with_config(BusConfig {
            failure_threshold: Some(2),
            ..BusConfig::default()
        });
        let broken: MessageHandler =
            Arc::new(|_| Err(PluginError::execution_failed("handler broke")));
        bus.subscribe("broken", "evt", None, broken).unwrap();

        for _ in 0..3 {
            let _ = bus
                .publish(Message::new("evt", "p", json!({})), DeliveryMode::Fast)
                .await;
        }

        wait_until(|| bus.statistics().active_subscriptions == 0).await;
        assert!(bus.statistics().handler_failures >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn statistics_track_types_and_reset() {
        let bus = MessageBus::new();
        let (handler, _) = sink();
        bus.subscribe("s", "a", None, handler).unwrap();

        bus.publish(Message::new("a", "p", json!({})), DeliveryMode::Reliable)
            .await
            .unwrap();
        bus.publish(Message::new("b", "p", json!({})), DeliveryMode::Fast)
            .await
            .unwrap();

        let stats = bus.statistics();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.per_type.get("a"), Some(&1));
        assert_eq!(stats.per_type.get("b"), Some(&1));

        bus.reset_statistics();
        let stats = bus.statistics();
        assert_eq!(stats.total_messages, 0);
        assert!(stats.per_type.is_empty());
        assert_eq!(stats.active_subscriptions, 1);
    }
}
