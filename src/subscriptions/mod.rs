//! Long-poll mailboxes.
//!
//! A [`Subscription`] buffers messages for a fixed set of topics until its
//! owner drains them with a bounded-wait poll:
//! - Offers for other topics are ignored
//! - A poll returns at once if data is pending, otherwise waits for the
//!   next offer, for closure, or for its deadline
//! - An idle subscription expires after its inactivity timeout
//!
//! # Example
//!
//! ```
//! use lpoll::{ExpiryScheduler, Subscription};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! let scheduler = ExpiryScheduler::new()?;
//! let (expired_tx, expired) = mpsc::channel();
//!
//! let mailbox = Subscription::create(&scheduler, Duration::from_millis(50), 100, ["news"], move |id| {
//!     let _ = expired_tx.send(id);
//! });
//! mailbox.offer("hello", "news");
//! assert_eq!(mailbox.poll(Duration::from_secs(1)), vec!["hello"]);
//!
//! // No further polls: the mailbox expires on its own.
//! assert_eq!(&expired.recv_timeout(Duration::from_secs(2)).unwrap(), mailbox.id());
//! # Ok::<(), lpoll::LpollError>(())
//! ```

mod mailbox;
mod timer;
mod types;

pub use mailbox::Subscription;
pub use timer::ExpiryScheduler;
pub use types::{SubscriptionId, SubscriptionInfo};
