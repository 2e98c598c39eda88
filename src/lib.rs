//! # lpoll
//!
//! An in-process, topic-keyed long-polling mailbox registry.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: mailboxes bound to a fixed set of topics
//! - **Publish**: fire-and-forget fan-out of a payload to every matching mailbox
//! - **Poll**: bounded wait for new messages, draining the mailbox
//! - **Expiry**: subscriptions that stop polling remove themselves
//!
//! Transport layers (HTTP, RPC, CLI) sit outside this crate and call the
//! [`Registry`] operations.
//!
//! ## Example
//!
//! ```
//! use lpoll::Registry;
//! use std::time::Duration;
//!
//! let registry = Registry::new()?;
//!
//! let id = registry.subscribe(Duration::from_secs(30), ["orders"])?;
//! registry.publish("order #1".to_string(), ["orders", "audit"]);
//!
//! let messages = registry.poll(&id, Duration::from_secs(1))?;
//! assert_eq!(messages, vec!["order #1".to_string()]);
//!
//! registry.drop_subscription(&id);
//! assert!(registry.poll(&id, Duration::ZERO).is_err());
//! # Ok::<(), lpoll::LpollError>(())
//! ```

mod dispatch;
pub mod error;
pub mod registry;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use error::{LpollError, Result};
pub use registry::{Registry, RegistryConfig, RegistryStats, DEFAULT_MAILBOX_CAPACITY};
pub use subscriptions::{ExpiryScheduler, Subscription, SubscriptionId, SubscriptionInfo};
pub use types::{topic_set, Timestamp};
