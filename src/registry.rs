//! Registry of live subscriptions: subscribe, publish, poll, drop.

use crate::dispatch::Dispatcher;
use crate::error::{LpollError, Result};
use crate::subscriptions::{ExpiryScheduler, Subscription, SubscriptionId, SubscriptionInfo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Default number of messages a mailbox holds before discarding the oldest.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1000;

/// Upper bound on the default dispatcher pool size.
const MAX_DEFAULT_WORKERS: usize = 8;

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Max pending messages per mailbox; the oldest is discarded beyond it.
    /// Default: 1000
    pub mailbox_capacity: usize,

    /// Worker threads fanning published messages out to mailboxes.
    /// Default: available parallelism, capped at 8.
    pub dispatch_workers: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_DEFAULT_WORKERS);

        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            dispatch_workers: workers,
        }
    }
}

/// Registry-wide counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Distinct topics claimed by live subscriptions.
    pub topics: usize,
    /// Offers queued for delivery since the registry was created.
    pub offers_dispatched: u64,
    /// Subscriptions removed by inactivity expiry.
    pub expired: u64,
    /// Messages discarded by full mailboxes of live subscriptions.
    pub messages_dropped: u64,
}

/// Why a subscription left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Removal {
    Dropped,
    Expired,
}

struct Inner<T> {
    /// Live subscriptions by id. Every entry is open.
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription<T>>>>,
    dispatcher: Dispatcher<T>,
    /// Drives the inactivity timers of every subscription.
    scheduler: ExpiryScheduler,
    config: RegistryConfig,
    offers_dispatched: AtomicU64,
    expired: AtomicU64,
}

impl<T> Inner<T> {
    /// Check-and-remove under the write lock, closing the mailbox in the
    /// same critical section. Returns false if the id was already gone.
    fn remove(&self, id: &SubscriptionId, reason: Removal) -> bool {
        let mut subs = self.subscriptions.write();
        let Some(sub) = subs.remove(id) else {
            return false;
        };
        sub.close();
        drop(subs);

        if reason == Removal::Expired {
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        debug!(subscription = %id, ?reason, "subscription removed");
        true
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        for (_, sub) in self.subscriptions.get_mut().drain() {
            sub.close();
        }
    }
}

/// Topic-keyed long-poll mailbox registry.
///
/// Cloning is cheap and yields another handle to the same registry. When
/// the last handle is dropped every remaining subscription is closed and
/// the dispatcher and expiry threads are stopped. A registry runs
/// `dispatch_workers + 1` background threads regardless of how many
/// subscriptions it holds.
///
/// The registry lock is held only around map reads and writes, never across
/// a poll wait or a mailbox offer.
pub struct Registry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Registry<T> {
    /// Create a registry with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with a custom configuration.
    pub fn with_config(config: RegistryConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.dispatch_workers)?;
        let scheduler = ExpiryScheduler::new()?;

        Ok(Self {
            inner: Arc::new(Inner {
                subscriptions: RwLock::new(HashMap::new()),
                dispatcher,
                scheduler,
                config,
                offers_dispatched: AtomicU64::new(0),
                expired: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Create a subscription to `topics` and return its id.
    ///
    /// The subscription expires once `timeout` passes without a poll. A zero
    /// timeout is rejected.
    pub fn subscribe<I, S>(&self, timeout: Duration, topics: I) -> Result<SubscriptionId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if timeout.is_zero() {
            return Err(LpollError::InvalidTimeout);
        }

        let registry: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let sub = Arc::new(Subscription::create_unarmed(
            &self.inner.scheduler,
            timeout,
            self.inner.config.mailbox_capacity,
            topics,
            move |id| {
                if let Some(inner) = registry.upgrade() {
                    inner.remove(&id, Removal::Expired);
                }
            },
        ));
        let id = sub.id().clone();

        self.inner
            .subscriptions
            .write()
            .insert(id.clone(), Arc::clone(&sub));
        // Start the countdown only once the expiry callback can find the entry.
        sub.arm();

        debug!(subscription = %id, topics = ?sub.topics(), ?timeout, "subscribed");
        Ok(id)
    }

    /// Broadcast `payload` to every live subscription on each of `topics`.
    ///
    /// Returns the number of offers queued. Delivery happens on the
    /// dispatcher threads; this call never waits on a mailbox. A
    /// subscription listening on several of the given topics receives the
    /// payload once per matching topic.
    pub fn publish<I, S>(&self, payload: T, topics: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics: Vec<Arc<str>> = topics.into_iter().map(|t| Arc::from(t.as_ref())).collect();

        let mut targets: Vec<(Arc<Subscription<T>>, Arc<str>)> = Vec::new();
        {
            let subs = self.inner.subscriptions.read();
            for topic in &topics {
                for sub in subs.values().filter(|sub| sub.wants(topic)) {
                    targets.push((Arc::clone(sub), Arc::clone(topic)));
                }
            }
        }

        let count = targets.len();
        if let Some((last, last_topic)) = targets.pop() {
            for (sub, topic) in targets {
                self.inner.dispatcher.dispatch(sub, payload.clone(), topic);
            }
            self.inner.dispatcher.dispatch(last, payload, last_topic);
        }
        self.inner
            .offers_dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Long-poll subscription `id` for up to `wait`.
    ///
    /// Returns the drained messages (empty on timeout or when the
    /// subscription closes mid-wait). Fails with [`LpollError::NotFound`] if
    /// the id is unknown, dropped or expired. Concurrent polls on the same
    /// id are not supported; callers poll sequentially.
    pub fn poll(&self, id: &SubscriptionId, wait: Duration) -> Result<Vec<T>> {
        let sub = self
            .inner
            .subscriptions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LpollError::NotFound(id.clone()))?;

        Ok(sub.poll(wait))
    }

    /// Close and remove subscription `id`. Returns false if it was absent.
    pub fn drop_subscription(&self, id: &SubscriptionId) -> bool {
        self.inner.remove(id, Removal::Dropped)
    }

    /// Close and remove every subscription. Returns how many were removed.
    ///
    /// The registry stays usable afterwards.
    pub fn shutdown(&self) -> usize {
        let mut subs = self.inner.subscriptions.write();
        let count = subs.len();
        for (_, sub) in subs.drain() {
            sub.close();
        }
        drop(subs);

        debug!(count, "registry shut down");
        count
    }

    /// Snapshot of live subscription ids.
    pub fn list(&self) -> Vec<SubscriptionId> {
        self.inner.subscriptions.read().keys().cloned().collect()
    }

    /// Snapshot of topics claimed by at least one live subscription, sorted.
    pub fn topics(&self) -> Vec<String> {
        let subs = self.inner.subscriptions.read();
        let topics: BTreeSet<&String> = subs.values().flat_map(|sub| sub.topics()).collect();
        topics.into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.subscriptions.read().is_empty()
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.inner.subscriptions.read().contains_key(id)
    }

    /// Introspect one live subscription.
    pub fn info(&self, id: &SubscriptionId) -> Option<SubscriptionInfo> {
        let sub = self.inner.subscriptions.read().get(id).cloned()?;
        Some(sub.info())
    }

    pub fn stats(&self) -> RegistryStats {
        let subs: Vec<Arc<Subscription<T>>> =
            self.inner.subscriptions.read().values().cloned().collect();

        let topics: BTreeSet<&String> = subs.iter().flat_map(|sub| sub.topics()).collect();
        RegistryStats {
            subscriptions: subs.len(),
            topics: topics.len(),
            offers_dispatched: self.inner.offers_dispatched.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
            messages_dropped: subs.iter().map(|sub| sub.dropped()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const LONG: Duration = Duration::from_secs(60);

    fn registry() -> Registry<String> {
        Registry::with_config(RegistryConfig {
            dispatch_workers: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_subscribe_drop() {
        let registry = registry();

        let id = registry.subscribe(LONG, ["a"]).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));

        assert!(registry.drop_subscription(&id));
        assert!(registry.is_empty());
        // Second removal is a no-op.
        assert!(!registry.drop_subscription(&id));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let registry = registry();
        let result = registry.subscribe(Duration::ZERO, ["a"]);
        assert!(matches!(result, Err(LpollError::InvalidTimeout)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_publish_counts_matching_offers() {
        let registry = registry();
        registry.subscribe(LONG, ["a"]).unwrap();
        registry.subscribe(LONG, ["a", "b"]).unwrap();
        registry.subscribe(LONG, ["c"]).unwrap();

        assert_eq!(registry.publish("x".to_string(), ["a", "b"]), 3);
        assert_eq!(registry.publish("y".to_string(), ["zzz"]), 0);
        assert_eq!(registry.stats().offers_dispatched, 3);
    }

    /// Payload that counts how often it is cloned.
    #[derive(Debug)]
    struct Counted(Arc<AtomicU64>);

    impl Clone for Counted {
        fn clone(&self) -> Self {
            self.0.fetch_add(1, Ordering::SeqCst);
            Counted(Arc::clone(&self.0))
        }
    }

    #[test]
    fn test_publish_clones_once_per_extra_target() {
        let registry: Registry<Counted> = Registry::with_config(RegistryConfig {
            dispatch_workers: 2,
            ..Default::default()
        })
        .unwrap();
        let ids: Vec<_> = (0..3).map(|_| registry.subscribe(LONG, ["a"]).unwrap()).collect();

        let clones = Arc::new(AtomicU64::new(0));
        assert_eq!(registry.publish(Counted(Arc::clone(&clones)), ["a"]), 3);
        assert_eq!(clones.load(Ordering::SeqCst), 2);

        for id in &ids {
            assert_eq!(registry.poll(id, Duration::from_secs(2)).unwrap().len(), 1);
        }

        // A single target takes the payload without cloning.
        let single = Arc::new(AtomicU64::new(0));
        registry.drop_subscription(&ids[0]);
        registry.drop_subscription(&ids[1]);
        assert_eq!(registry.publish(Counted(Arc::clone(&single)), ["a"]), 1);
        assert_eq!(single.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_poll_unknown_id() {
        let registry = registry();
        let missing = SubscriptionId::from("missing");

        let err = registry.poll(&missing, Duration::ZERO).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_poll_receives_published() {
        let registry = registry();
        let id = registry.subscribe(LONG, ["a"]).unwrap();

        registry.publish("hello".to_string(), ["a"]);

        let start = Instant::now();
        let messages = registry.poll(&id, Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(messages, vec!["hello".to_string()]);
    }

    #[test]
    fn test_drop_unblocks_poll() {
        let registry = registry();
        let id = registry.subscribe(LONG, ["a"]).unwrap();

        let dropper = registry.clone();
        let target = id.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            dropper.drop_subscription(&target);
        });

        let start = Instant::now();
        let messages = registry.poll(&id, Duration::from_secs(5)).unwrap();
        assert!(messages.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();

        assert!(registry.poll(&id, Duration::ZERO).unwrap_err().is_not_found());
    }

    #[test]
    fn test_topics_snapshot() {
        let registry = registry();
        registry.subscribe(LONG, ["b", "a"]).unwrap();
        let id = registry.subscribe(LONG, ["c", "a"]).unwrap();

        assert_eq!(registry.topics(), vec!["a", "b", "c"]);

        registry.drop_subscription(&id);
        assert_eq!(registry.topics(), vec!["a", "b"]);
    }

    #[test]
    fn test_expiry_counts_in_stats() {
        let registry = registry();
        let id = registry.subscribe(Duration::from_millis(30), ["a"]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.contains(&id) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert!(!registry.contains(&id));
        assert_eq!(registry.stats().expired, 1);
    }

    #[test]
    fn test_drop_does_not_count_as_expired() {
        let registry = registry();
        let id = registry.subscribe(LONG, ["a"]).unwrap();
        registry.drop_subscription(&id);
        assert_eq!(registry.stats().expired, 0);
    }

    #[test]
    fn test_info() {
        let registry = registry();
        let id = registry.subscribe(LONG, ["a"]).unwrap();

        let info = registry.info(&id).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.topics, vec!["a".to_string()]);
        assert_eq!(info.inactivity_timeout, LONG);

        registry.drop_subscription(&id);
        assert!(registry.info(&id).is_none());
    }

    #[test]
    fn test_shutdown_keeps_registry_usable() {
        let registry = registry();
        registry.subscribe(LONG, ["a"]).unwrap();
        registry.subscribe(LONG, ["b"]).unwrap();

        assert_eq!(registry.shutdown(), 2);
        assert!(registry.list().is_empty());

        let id = registry.subscribe(LONG, ["a"]).unwrap();
        assert_eq!(registry.list(), vec![id]);
    }

    #[test]
    fn test_dropping_registry_closes_subscriptions() {
        let registry = registry();
        let id = registry.subscribe(LONG, ["a"]).unwrap();
        let sub = registry.inner.subscriptions.read().get(&id).cloned().unwrap();

        drop(registry);
        assert!(sub.is_closed());
    }
}
