//! Leadership capability
//!
//! Only the holder of a [`LeaderToken`] may write cluster-topology keys or
//! issue cluster-mutating admin operations. Tokens are minted from the current
//! [`Leadership`] and must be re-obtained before every mutating step, so a unit
//! that lost the lease mid-pass stops at the next step.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::events::UnitEvent;

/// Lease configuration
pub const LEASE_TTL_SECS: u64 = 15;
pub const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Whether this unit currently holds the lease
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leadership {
    Leader,
    Follower,
}

impl Leadership {
    pub fn is_leader(self) -> bool {
        self == Leadership::Leader
    }

    /// Proof of leadership, only available to the leader
    pub fn token(self) -> Option<LeaderToken> {
        match self {
            Leadership::Leader => Some(LeaderToken { _private: () }),
            Leadership::Follower => None,
        }
    }
}

/// Capability required by topology writes
#[derive(Clone, Copy, Debug)]
pub struct LeaderToken {
    _private: (),
}

/// Leadership flag shared between the lease runner and the reconciler
#[derive(Clone, Debug, Default)]
pub struct LeadershipState {
    leader: Arc<AtomicBool>,
}

impl LeadershipState {
    pub fn new(initial: Leadership) -> Self {
        Self {
            leader: Arc::new(AtomicBool::new(initial.is_leader())),
        }
    }

    pub fn current(&self) -> Leadership {
        if self.leader.load(Ordering::SeqCst) {
            Leadership::Leader
        } else {
            Leadership::Follower
        }
    }

    /// Record the new leadership; returns whether it changed
    pub fn set(&self, leadership: Leadership) -> bool {
        self.leader.swap(leadership.is_leader(), Ordering::SeqCst) != leadership.is_leader()
    }

    /// Token if this unit leads right now
    pub fn token(&self) -> Option<LeaderToken> {
        self.current().token()
    }
}

/// Keep trying to acquire or renew the lease, emitting leadership events.
///
/// Losing the lease never exits the process: the unit keeps serving as a
/// follower and re-enters the election on the next interval.
pub async fn run_lease(
    client: Client,
    config: OperatorConfig,
    state: LeadershipState,
    events: mpsc::Sender<UnitEvent>,
) {
    let lease_lock = LeaseLock::new(
        client,
        &config.namespace,
        LeaseLockParams {
            holder_id: config.unit_name.clone(),
            lease_name: config.lease_name(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    info!(
        holder_id = %config.unit_name,
        lease_name = %config.lease_name(),
        "Initializing leader election"
    );

    loop {
        let leadership = match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => Leadership::Leader,
            Ok(_) => Leadership::Follower,
            Err(e) => {
                warn!(error = %e, "Failed to acquire or renew lease");
                Leadership::Follower
            }
        };

        if state.set(leadership) {
            let event = match leadership {
                Leadership::Leader => {
                    info!("Acquired leadership");
                    UnitEvent::LeaderElected
                }
                Leadership::Follower => {
                    warn!("Lost leadership, continuing as follower");
                    UnitEvent::LeadershipLost
                }
            };
            if events.send(event).await.is_err() {
                info!("Event loop closed, stopping lease runner");
                return;
            }
        }

        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }
}
