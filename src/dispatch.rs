//! Background fan-out of published messages to mailboxes.
//!
//! Publishing only enqueues work here; a fixed pool of worker threads
//! applies the offers. Each mailbox is pinned to one worker, so offers to a
//! given mailbox are applied in the order they were published.

use crate::error::Result;
use crate::subscriptions::{Subscription, SubscriptionId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Control messages for a dispatch worker.
enum DispatchMessage<T> {
    Deliver {
        mailbox: Arc<Subscription<T>>,
        payload: T,
        topic: Arc<str>,
    },
    Shutdown,
}

struct Worker<T> {
    sender: Sender<DispatchMessage<T>>,
    handle: Option<JoinHandle<()>>,
}

/// Fixed pool of fan-out workers.
pub(crate) struct Dispatcher<T> {
    workers: Vec<Worker<T>>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Start `workers` threads (at least one).
    pub(crate) fn new(workers: usize) -> Result<Self> {
        let count = workers.max(1);
        let mut pool = Vec::with_capacity(count);

        for index in 0..count {
            let (sender, receiver) = unbounded();
            let handle = thread::Builder::new()
                .name(format!("lpoll-dispatch-{index}"))
                .spawn(move || Self::worker_loop(receiver))?;
            pool.push(Worker {
                sender,
                handle: Some(handle),
            });
        }

        debug!(workers = count, "dispatcher started");
        Ok(Self { workers: pool })
    }

    /// Queue an offer of `payload` on `topic` to `mailbox`. Never blocks.
    pub(crate) fn dispatch(&self, mailbox: Arc<Subscription<T>>, payload: T, topic: Arc<str>) {
        let worker = &self.workers[self.shard_for(mailbox.id())];
        let _ = worker.sender.send(DispatchMessage::Deliver {
            mailbox,
            payload,
            topic,
        });
    }

    fn shard_for(&self, id: &SubscriptionId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.workers.len() as u64) as usize
    }

    fn worker_loop(receiver: Receiver<DispatchMessage<T>>) {
        while let Ok(message) = receiver.recv() {
            match message {
                DispatchMessage::Deliver {
                    mailbox,
                    payload,
                    topic,
                } => {
                    if mailbox.offer(payload, &topic) {
                        trace!(subscription = %mailbox.id(), topic = %topic, "delivered");
                    }
                }
                DispatchMessage::Shutdown => break,
            }
        }
    }
}

impl<T> Drop for Dispatcher<T> {
    fn drop(&mut self) {
        // Queued deliveries ahead of the shutdown message still run.
        for worker in &self.workers {
            let _ = worker.sender.send(DispatchMessage::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
        debug!("dispatcher stopped");
    }
}
