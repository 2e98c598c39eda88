//! Subscription types shared by the mailbox and the registry.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque handle naming one subscription.
///
/// Generated from a random v4 UUID, so ids never collide between live
/// subscriptions, even across independent registries.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        SubscriptionId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        SubscriptionId(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        SubscriptionId(s.to_string())
    }
}

impl Borrow<str> for SubscriptionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriptionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Point-in-time view of one subscription (for introspection).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    /// Topics the subscription was created with, sorted.
    pub topics: Vec<String>,
    /// Inactivity window before the subscription expires.
    pub inactivity_timeout: Duration,
    /// Messages buffered and not yet polled.
    pub pending: usize,
    /// Messages discarded because the mailbox was full.
    pub dropped: u64,
    pub created: Timestamp,
}
