//! Peer state: typed, permission-checked access to the shared key space
//!
//! Writes go through compare-and-set. On a version conflict the write set is
//! re-derived from a fresh read and retried, so concurrent writers never lose
//! each other's updates.

pub mod lock;
pub mod record;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};
use crate::leadership::LeaderToken;
use crate::store::{PeerScope, PeerSnapshot, PeerStateStore, PeerWrite, StoreError};

pub use lock::AdvisoryLock;
pub use record::{MemberState, PeerRecord, RestoreMarker, UnitRecord};

use record::{
    BACKUP_LOCK, CLUSTER_INITIALIZED, CLUSTER_MEMBERS, CLUSTER_NAME, RESTORE_IN_PROGRESS,
    UNITS_ADDED_TO_CLUSTER, encode_members, is_topology_key,
};

/// Attempts before a write loop gives up on a contended key space
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Unit-scoped keys pruned when a departed unit leaves the cluster
const UNIT_KEYS: [&str; 6] = [
    record::ADDRESS,
    record::MEMBER_STATE,
    record::DEPARTING,
    record::HEARTBEAT,
    record::TLS_DIGEST,
    record::UNIT_STATUS,
];

/// Change to the cluster-topology keys, applied against the latest record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyUpdate {
    /// The cluster was bootstrapped on `unit`
    ClusterCreated { cluster_name: String, unit: String },
    /// A live cluster was found without the initialized flag
    Adopted {
        cluster_name: String,
        members: BTreeSet<String>,
    },
    MemberAdded { unit: String },
    /// Drops the member; a departing unit's own entries go with it
    MemberRemoved { unit: String },
    RestoreStarted(RestoreMarker),
    /// Clears the marker and leaves the cluster to be re-initialized
    RestoreFinished,
}

impl TopologyUpdate {
    /// Writes realizing this update on top of `current`
    fn writes(&self, current: &PeerRecord) -> Result<Vec<PeerWrite>> {
        let writes = match self {
            TopologyUpdate::ClusterCreated { cluster_name, unit } => vec![
                PeerWrite::app(CLUSTER_INITIALIZED, "true"),
                PeerWrite::app(CLUSTER_NAME, cluster_name.as_str()),
                PeerWrite::app(
                    UNITS_ADDED_TO_CLUSTER,
                    current.units_added_to_cluster.max(1).to_string(),
                ),
                PeerWrite::app(
                    CLUSTER_MEMBERS,
                    encode_members(&BTreeSet::from([unit.clone()])),
                ),
            ],
            TopologyUpdate::Adopted {
                cluster_name,
                members,
            } => vec![
                PeerWrite::app(CLUSTER_INITIALIZED, "true"),
                PeerWrite::app(CLUSTER_NAME, cluster_name.as_str()),
                PeerWrite::app(
                    UNITS_ADDED_TO_CLUSTER,
                    current
                        .units_added_to_cluster
                        .max(members.len() as u64)
                        .to_string(),
                ),
                PeerWrite::app(CLUSTER_MEMBERS, encode_members(members)),
            ],
            TopologyUpdate::MemberAdded { unit } => {
                if current.members.contains(unit) {
                    Vec::new()
                } else {
                    let mut members = current.members.clone();
                    members.insert(unit.clone());
                    vec![
                        PeerWrite::app(
                            UNITS_ADDED_TO_CLUSTER,
                            (current.units_added_to_cluster + 1).to_string(),
                        ),
                        PeerWrite::app(CLUSTER_MEMBERS, encode_members(&members)),
                    ]
                }
            }
            TopologyUpdate::MemberRemoved { unit } => {
                let mut writes = Vec::new();
                if current.members.contains(unit) {
                    let mut members = current.members.clone();
                    members.remove(unit);
                    writes.push(PeerWrite::app(CLUSTER_MEMBERS, encode_members(&members)));
                }
                if current.unit(unit).is_some_and(|u| u.departing) {
                    let scope = PeerScope::Unit(unit.clone());
                    writes.extend(UNIT_KEYS.iter().map(|key| PeerWrite::delete(scope.clone(), key)));
                }
                writes
            }
            TopologyUpdate::RestoreStarted(marker) => vec![PeerWrite::app(
                RESTORE_IN_PROGRESS,
                serde_json::to_string(marker)?,
            )],
            TopologyUpdate::RestoreFinished => vec![
                PeerWrite::delete(PeerScope::App, RESTORE_IN_PROGRESS),
                PeerWrite::app(CLUSTER_INITIALIZED, "false"),
                PeerWrite::app(CLUSTER_MEMBERS, encode_members(&BTreeSet::new())),
            ],
        };
        Ok(writes)
    }
}

/// Drop writes that would leave the key space unchanged.
///
/// Only the last write to each key counts.
fn effective_writes(snapshot: &PeerSnapshot, writes: Vec<PeerWrite>) -> Vec<PeerWrite> {
    let mut last: Vec<PeerWrite> = Vec::with_capacity(writes.len());
    for write in writes {
        last.retain(|earlier| earlier.scope != write.scope || earlier.key != write.key);
        last.push(write);
    }
    last.into_iter()
        .filter(|write| {
            let current = match &write.scope {
                PeerScope::App => snapshot.app_value(&write.key),
                PeerScope::Unit(unit) => snapshot.unit_value(unit, &write.key),
            };
            current != write.value.as_deref()
        })
        .collect()
}

/// Reject any write that would lower the units-added counter
fn check_monotonic(current: &PeerRecord, writes: &[PeerWrite]) -> Result<()> {
    for write in writes {
        if write.scope != PeerScope::App || write.key != UNITS_ADDED_TO_CLUSTER {
            continue;
        }
        let next: u64 = write
            .value
            .as_deref()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Fatal(format!("{} must stay an integer", UNITS_ADDED_TO_CLUSTER)))?;
        if next < current.units_added_to_cluster {
            return Err(Error::Fatal(format!(
                "{} would decrease from {} to {}",
                UNITS_ADDED_TO_CLUSTER, current.units_added_to_cluster, next
            )));
        }
    }
    Ok(())
}

/// One unit's handle on the peer key space
#[derive(Clone)]
pub struct PeerState {
    store: Arc<dyn PeerStateStore>,
    unit: String,
}

impl PeerState {
    pub fn new(store: Arc<dyn PeerStateStore>, unit: &str) -> Self {
        Self {
            store,
            unit: unit.to_string(),
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub async fn read(&self) -> Result<PeerRecord> {
        let snapshot = self.store.snapshot().await?;
        Ok(PeerRecord::from_snapshot(&snapshot)?)
    }

    /// Compare-and-set loop re-deriving its writes from every fresh read
    async fn write_with<F>(&self, mut derive: F) -> Result<PeerRecord>
    where
        F: FnMut(&PeerRecord) -> Result<Vec<PeerWrite>>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.read().await?;
            let writes = effective_writes(&current.raw, derive(&current)?);
            if writes.is_empty() {
                return Ok(current);
            }
            check_monotonic(&current, &writes)?;

            match self.store.apply(&current.version, &writes).await {
                Ok(version) => {
                    debug!(
                        unit = %self.unit,
                        writes = writes.len(),
                        version = %version,
                        "Peer state updated"
                    );
                    let mut next = current.raw.clone();
                    next.apply_writes(&writes);
                    next.version = version;
                    return Ok(PeerRecord::from_snapshot(&next)?);
                }
                Err(e) if e.is_conflict() => {
                    debug!(unit = %self.unit, attempt, "Peer write conflict, re-deriving");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(unit = %self.unit, "Peer state contended, giving up for this pass");
        Err(Error::Store(StoreError::Conflict {
            expected: "any".to_string(),
            actual: format!("still changing after {} attempts", MAX_CAS_ATTEMPTS),
        }))
    }

    /// Write this unit's own entries; `None` deletes a key
    pub async fn update_unit(&self, entries: &[(&str, Option<String>)]) -> Result<PeerRecord> {
        let scope = PeerScope::Unit(self.unit.clone());
        self.write_with(|_| {
            Ok(entries
                .iter()
                .map(|(key, value)| PeerWrite {
                    scope: scope.clone(),
                    key: key.to_string(),
                    value: value.clone(),
                })
                .collect())
        })
        .await
    }

    /// Apply topology updates; requires leadership
    pub async fn update_topology(
        &self,
        _token: &LeaderToken,
        updates: &[TopologyUpdate],
    ) -> Result<PeerRecord> {
        self.write_with(|current| {
            let mut writes = Vec::new();
            let mut staged = current.clone();
            for update in updates {
                let step = update.writes(&staged)?;
                let mut raw = staged.raw.clone();
                raw.apply_writes(&step);
                raw.version = current.version.clone();
                staged = PeerRecord::from_snapshot(&raw)?;
                writes.extend(step);
            }
            Ok(writes)
        })
        .await
    }

    /// Compare-and-set a shared, non-topology application key.
    ///
    /// Returns `false` when the current value is not `expected`.
    pub async fn compare_and_set_shared(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<String>,
    ) -> Result<bool> {
        if is_topology_key(key) {
            return Err(Error::Fatal(format!(
                "{} is a topology key and needs leadership",
                key
            )));
        }
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.store.snapshot().await?;
            if snapshot.app_value(key) != expected {
                return Ok(false);
            }
            let write = PeerWrite {
                scope: PeerScope::App,
                key: key.to_string(),
                value: value.clone(),
            };
            match self.store.apply(&snapshot.version, &[write]).await {
                Ok(_) => return Ok(true),
                // Unrelated keys may have moved; re-check ours
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Take the backup/restore lock, reclaiming it when stale
    pub async fn acquire_lock(
        &self,
        operation: &str,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<AdvisoryLock> {
        let current = self.read().await?;
        let expected = current.raw.app_value(BACKUP_LOCK).map(str::to_string);
        if let Some(held) = &current.backup_lock {
            if !held.is_stale(now, staleness) {
                return Err(Error::LockHeld {
                    owner: held.owner.clone(),
                    operation: held.operation.clone(),
                });
            }
            warn!(
                owner = %held.owner,
                operation = %held.operation,
                acquired_at = %held.acquired_at,
                "Reclaiming stale lock"
            );
        }

        let lock = AdvisoryLock::new(&self.unit, operation, now);
        let encoded = serde_json::to_string(&lock)?;
        if self
            .compare_and_set_shared(BACKUP_LOCK, expected.as_deref(), Some(encoded))
            .await?
        {
            Ok(lock)
        } else {
            let holder = self.read().await?.backup_lock;
            Err(Error::LockHeld {
                owner: holder.as_ref().map(|l| l.owner.clone()).unwrap_or_default(),
                operation: holder.map(|l| l.operation).unwrap_or_default(),
            })
        }
    }

    /// Whether `lock` is still the held acquisition
    pub async fn holds_lock(&self, lock: &AdvisoryLock) -> Result<bool> {
        Ok(self
            .read()
            .await?
            .backup_lock
            .is_some_and(|held| held.same_acquisition(lock)))
    }

    /// Release `lock` if it is still ours; a reclaimed lock is left alone
    pub async fn release_lock(&self, lock: &AdvisoryLock) -> Result<()> {
        let current = self.read().await?;
        match &current.backup_lock {
            Some(held) if held.same_acquisition(lock) => {
                let expected = current.raw.app_value(BACKUP_LOCK).map(str::to_string);
                if !self
                    .compare_and_set_shared(BACKUP_LOCK, expected.as_deref(), None)
                    .await?
                {
                    warn!(operation = %lock.operation, "Lock changed while releasing");
                }
            }
            Some(held) => {
                warn!(
                    owner = %held.owner,
                    operation = %lock.operation,
                    "Lock was reclaimed by another unit, not releasing"
                );
            }
            None => {}
        }
        Ok(())
    }
}
