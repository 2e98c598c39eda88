//! Error types for the long-poll registry.

use crate::subscriptions::SubscriptionId;
use thiserror::Error;

/// Main error type for registry operations.
#[derive(Debug, Error)]
pub enum LpollError {
    /// The id was never issued, or its subscription was dropped or expired.
    #[error("Subscription not found: {0}")]
    NotFound(SubscriptionId),

    #[error("Inactivity timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Failed to spawn background thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl LpollError {
    /// True for the "unknown subscription" condition callers retry on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LpollError::NotFound(_))
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, LpollError>;
