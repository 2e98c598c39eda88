//! Inactivity timers driven by one scheduler thread.
//!
//! Each [`ExpiryTimer`] is a handle into an [`ExpiryScheduler`], which keeps
//! a min-heap of deadlines. Rearming pushes a new entry tagged with the
//! timer's next generation; entries whose generation is no longer current,
//! or whose timer was cancelled, are skipped when they come due.

use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

type Callback = Box<dyn FnOnce() + Send>;

/// State shared between a timer handle and its heap entries.
struct TimerState {
    /// Bumped on every arm; only the entry carrying the latest value fires.
    generation: AtomicU64,
    cancelled: AtomicBool,
    on_fire: Mutex<Option<Callback>>,
}

impl TimerState {
    fn is_current(&self, generation: u64) -> bool {
        !self.cancelled.load(Ordering::Acquire)
            && self.generation.load(Ordering::Acquire) == generation
    }

    fn fire(&self) {
        // Taken under the lock, run without it: the callback may cancel us.
        let callback = self.on_fire.lock().take();
        if let Some(callback) = callback {
            trace!("expiry timer fired");
            callback();
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    generation: u64,
    timer: Arc<TimerState>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Ord for TimerEntry {
    // BinaryHeap is a max-heap; reversed so the earliest deadline is on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Commands sent to the scheduler thread.
enum SchedulerCommand {
    Schedule(TimerEntry),
    Shutdown,
}

/// Single background thread firing the expiry timers of many mailboxes.
///
/// Dropping the scheduler stops the thread; timers that have not fired by
/// then never fire.
pub struct ExpiryScheduler {
    commands: Sender<SchedulerCommand>,
    worker: Option<JoinHandle<()>>,
}

impl ExpiryScheduler {
    /// Start the scheduler thread.
    pub fn new() -> Result<Self> {
        let (commands, receiver) = unbounded();

        let worker = thread::Builder::new()
            .name("lpoll-expiry".to_string())
            .spawn(move || Self::run(receiver))?;

        debug!("expiry scheduler started");
        Ok(Self {
            commands,
            worker: Some(worker),
        })
    }

    /// Create an idle timer that runs `on_fire` at most once.
    pub(crate) fn timer<F>(&self, on_fire: F) -> ExpiryTimer
    where
        F: FnOnce() + Send + 'static,
    {
        ExpiryTimer {
            state: Arc::new(TimerState {
                generation: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                on_fire: Mutex::new(Some(Box::new(on_fire))),
            }),
            commands: self.commands.clone(),
        }
    }

    fn run(receiver: Receiver<SchedulerCommand>) {
        let mut heap: BinaryHeap<TimerEntry> = BinaryHeap::new();

        loop {
            let command = match heap.peek() {
                Some(next) => {
                    receiver.recv_timeout(next.deadline.saturating_duration_since(Instant::now()))
                }
                None => receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(SchedulerCommand::Schedule(entry)) => heap.push(entry),
                Ok(SchedulerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            while heap.peek().is_some_and(|next| next.deadline <= now) {
                if let Some(entry) = heap.pop() {
                    if entry.timer.is_current(entry.generation) {
                        entry.timer.fire();
                    }
                }
            }
        }

        debug!(pending = heap.len(), "expiry scheduler stopped");
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(SchedulerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            // An expiry callback can release the last registry handle, which
            // drops the scheduler on its own thread.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Handle to one mailbox's inactivity countdown.
///
/// Starts idle: nothing counts down until the first [`ExpiryTimer::arm`].
/// Dropping the handle cancels it.
pub(crate) struct ExpiryTimer {
    state: Arc<TimerState>,
    commands: Sender<SchedulerCommand>,
}

impl ExpiryTimer {
    /// Arm (or rearm) the timer to fire `timeout` from now.
    ///
    /// A timeout too large to represent as an `Instant` leaves the timer
    /// idle, so the mailbox never expires.
    pub(crate) fn arm(&self, timeout: Duration) {
        if self.state.cancelled.load(Ordering::Acquire) {
            return;
        }
        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(deadline) = Instant::now().checked_add(timeout) {
            // Fails only once the scheduler is gone.
            let _ = self.commands.send(SchedulerCommand::Schedule(TimerEntry {
                deadline,
                generation,
                timer: Arc::clone(&self.state),
            }));
        }
    }

    pub(crate) fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        // Release whatever the callback captured.
        drop(self.state.on_fire.lock().take());
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
