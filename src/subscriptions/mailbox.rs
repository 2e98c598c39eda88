//! Per-subscription mailbox: topic set, pending buffer, and long-poll wait.

use crate::types::{topic_set, Timestamp};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

use super::timer::{ExpiryScheduler, ExpiryTimer};
use super::types::{SubscriptionId, SubscriptionInfo};

/// Mutable mailbox state, guarded by [`Subscription::state`].
struct MailboxState<T> {
    buffer: VecDeque<T>,
    closed: bool,
    /// Messages discarded because the buffer was at capacity.
    dropped: u64,
}

/// One client's mailbox.
///
/// Publishers append through [`offer`](Self::offer); the client drains
/// through [`poll`](Self::poll). Polls are expected to be sequential: two
/// concurrent polls on the same mailbox share one wake signal and the first
/// to take the lock receives the data.
pub struct Subscription<T> {
    id: SubscriptionId,
    topics: BTreeSet<String>,
    inactivity_timeout: Duration,
    capacity: usize,
    created: Timestamp,
    state: Mutex<MailboxState<T>>,
    /// Signalled on offer and on close.
    ready: Condvar,
    timer: ExpiryTimer,
}

impl<T> Subscription<T> {
    /// Create a mailbox whose expiry timer calls `on_expire(id)`.
    ///
    /// The countdown starts immediately on `scheduler`; every
    /// [`poll`](Self::poll) restarts it.
    pub fn create<I, S, F>(
        scheduler: &ExpiryScheduler,
        inactivity_timeout: Duration,
        capacity: usize,
        topics: I,
        on_expire: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(SubscriptionId) + Send + 'static,
    {
        let sub = Self::create_unarmed(scheduler, inactivity_timeout, capacity, topics, on_expire);
        sub
    }

    /// Like [`create`](Self::create), but the timer stays idle until
    /// [`arm`](Self::arm), so the owner can register the mailbox first.
    pub(crate) fn create_unarmed<I, S, F>(
        scheduler: &ExpiryScheduler,
        inactivity_timeout: Duration,
        capacity: usize,
        topics: I,
        on_expire: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(SubscriptionId) + Send + 'static,
    {
        let id = SubscriptionId::generate();
        let expiring = id.clone();
        let timer = scheduler.timer(move || on_expire(expiring));

        Self {
            id,
            topics: topic_set(topics),
            inactivity_timeout,
            capacity: capacity.max(1),
            created: Timestamp::now(),
            state: Mutex::new(MailboxState {
                buffer: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
            timer,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Whether this mailbox accepts messages for `topic`.
    pub fn wants(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// Start (or restart) the inactivity countdown.
    pub fn arm(&self) {
        self.timer.arm(self.inactivity_timeout);
    }

    /// Append `payload` if the mailbox is open and subscribed to `topic`.
    ///
    /// Returns whether the payload was buffered. Does not count as activity
    /// for the inactivity timer. When the buffer is full the oldest pending
    /// message is discarded.
    pub fn offer(&self, payload: T, topic: &str) -> bool {
        if !self.wants(topic) {
            return false;
        }

        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        if state.buffer.len() >= self.capacity {
            state.buffer.pop_front();
            state.dropped += 1;
            warn!(
                subscription = %self.id,
                capacity = self.capacity,
                dropped = state.dropped,
                "mailbox full, discarding oldest message"
            );
        }
        state.buffer.push_back(payload);
        drop(state);

        self.ready.notify_all();
        true
    }

    /// Long-poll for pending messages.
    ///
    /// Rearms the inactivity timer, then returns as soon as the buffer holds
    /// data or the mailbox is closed, or once `wait` has elapsed (yielding an
    /// empty vector). A zero `wait` drains without blocking.
    pub fn poll(&self, wait: Duration) -> Vec<T> {
        self.arm();
        let deadline = Instant::now().checked_add(wait);

        let mut state = self.state.lock();
        while state.buffer.is_empty() && !state.closed {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }

        let messages: Vec<T> = state.buffer.drain(..).collect();
        trace!(subscription = %self.id, count = messages.len(), "poll resolved");
        messages
    }

    /// Close the mailbox and wake any waiting poll.
    ///
    /// Idempotent; returns `true` only for the call that closed it. Buffered
    /// messages stay readable by a final poll.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);

        self.timer.cancel();
        self.ready.notify_all();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of messages waiting to be polled.
    pub fn pending(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn info(&self) -> SubscriptionInfo {
        let state = self.state.lock();
        SubscriptionInfo {
            id: self.id.clone(),
            topics: self.topics.iter().cloned().collect(),
            inactivity_timeout: self.inactivity_timeout,
            pending: state.buffer.len(),
            dropped: state.dropped,
            created: self.created,
        }
    }
}
