//! Advisory locks in the peer key space
//!
//! A lock is a JSON value under a shared key, taken and released with
//! compare-and-set. It is advisory: a holder that dies leaves the lock behind
//! until it goes stale and another unit reclaims it, so holders re-check
//! ownership before committing results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner and purpose of a held lock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryLock {
    pub owner: String,
    /// Distinguishes two acquisitions by the same owner
    pub nonce: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

impl AdvisoryLock {
    pub fn new(owner: &str, operation: &str, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.to_string(),
            nonce: uuid::Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            acquired_at: now,
        }
    }

    /// Whether the lock is old enough to be reclaimed
    pub fn is_stale(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age.to_std().map(|age| age >= staleness).unwrap_or(false)
    }

    /// Same acquisition, not merely the same owner
    pub fn same_acquisition(&self, other: &AdvisoryLock) -> bool {
        self.owner == other.owner && self.nonce == other.nonce
    }
}
