//! Typed view over the peer key space

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lock::AdvisoryLock;
use crate::store::{PeerSnapshot, PeerVersion, StoreError};

// Application-scoped keys
pub const CLUSTER_INITIALIZED: &str = "cluster-initialized";
pub const CLUSTER_NAME: &str = "cluster-name";
pub const UNITS_ADDED_TO_CLUSTER: &str = "units-added-to-cluster";
pub const CLUSTER_MEMBERS: &str = "cluster-members";
pub const BACKUP_LOCK: &str = "backup-lock";
pub const RESTORE_IN_PROGRESS: &str = "restore-in-progress";

// Unit-scoped keys
pub const ADDRESS: &str = "address";
pub const MEMBER_STATE: &str = "member-state";
pub const DEPARTING: &str = "departing";
pub const HEARTBEAT: &str = "heartbeat";
pub const TLS_DIGEST: &str = "tls-digest";
pub const UNIT_STATUS: &str = "unit-status";

/// Keys only the leader may write
pub const TOPOLOGY_KEYS: [&str; 5] = [
    CLUSTER_INITIALIZED,
    CLUSTER_NAME,
    UNITS_ADDED_TO_CLUSTER,
    CLUSTER_MEMBERS,
    RESTORE_IN_PROGRESS,
];

pub fn is_topology_key(key: &str) -> bool {
    TOPOLOGY_KEYS.contains(&key)
}

/// Whether a unit's instance is configured and may join the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemberState {
    #[default]
    Waiting,
    Ready,
}

impl MemberState {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Waiting => "waiting",
            MemberState::Ready => "ready",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "ready" => MemberState::Ready,
            _ => MemberState::Waiting,
        }
    }
}

/// Restore in progress, written by the leader
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMarker {
    pub backup_id: String,
    /// Unit whose instance receives the data
    pub unit: String,
    pub started_at: DateTime<Utc>,
}

/// Entries a unit publishes about itself
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitRecord {
    pub address: Option<String>,
    pub member_state: MemberState,
    pub departing: bool,
    pub heartbeat: Option<DateTime<Utc>>,
    pub tls_digest: Option<String>,
    pub status: Option<String>,
}

impl UnitRecord {
    fn from_entries(entries: &BTreeMap<String, String>) -> Self {
        Self {
            address: entries.get(ADDRESS).cloned(),
            member_state: entries
                .get(MEMBER_STATE)
                .map(|s| MemberState::parse(s))
                .unwrap_or_default(),
            departing: entries.get(DEPARTING).is_some_and(|v| v == "true"),
            heartbeat: entries
                .get(HEARTBEAT)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
            tls_digest: entries.get(TLS_DIGEST).cloned(),
            status: entries.get(UNIT_STATUS).cloned(),
        }
    }

    /// Ready to be added: configured, addressable and not on its way out
    pub fn is_ready(&self) -> bool {
        self.member_state == MemberState::Ready && self.address.is_some() && !self.departing
    }
}

/// Peer key space decoded at one version
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerRecord {
    pub version: PeerVersion,
    pub cluster_initialized: bool,
    pub cluster_name: Option<String>,
    pub units_added_to_cluster: u64,
    /// Units recorded as cluster members by the leader
    pub members: BTreeSet<String>,
    pub backup_lock: Option<AdvisoryLock>,
    pub restore: Option<RestoreMarker>,
    pub units: BTreeMap<String, UnitRecord>,
    /// Undecoded key space, used to drop writes that change nothing
    pub raw: PeerSnapshot,
}

impl PeerRecord {
    pub fn from_snapshot(snapshot: &PeerSnapshot) -> Result<Self, StoreError> {
        let app = &snapshot.app;

        let units_added_to_cluster = match app.get(UNITS_ADDED_TO_CLUSTER) {
            Some(value) => value.parse().map_err(|_| {
                StoreError::Invalid(format!("{} is not an integer: {}", UNITS_ADDED_TO_CLUSTER, value))
            })?,
            None => 0,
        };
        let members: BTreeSet<String> = match app.get(CLUSTER_MEMBERS) {
            Some(value) => serde_json::from_str(value)?,
            None => BTreeSet::new(),
        };
        let backup_lock: Option<AdvisoryLock> = app
            .get(BACKUP_LOCK)
            .map(|value| serde_json::from_str(value))
            .transpose()?;
        let restore: Option<RestoreMarker> = app
            .get(RESTORE_IN_PROGRESS)
            .map(|value| serde_json::from_str(value))
            .transpose()?;

        Ok(Self {
            version: snapshot.version.clone(),
            cluster_initialized: app.get(CLUSTER_INITIALIZED).is_some_and(|v| v == "true"),
            cluster_name: app.get(CLUSTER_NAME).cloned(),
            units_added_to_cluster,
            members,
            backup_lock,
            restore,
            units: snapshot
                .units
                .iter()
                .map(|(unit, entries)| (unit.clone(), UnitRecord::from_entries(entries)))
                .collect(),
            raw: snapshot.clone(),
        })
    }

    pub fn unit(&self, unit: &str) -> Option<&UnitRecord> {
        self.units.get(unit)
    }

    pub fn ready_units(&self) -> impl Iterator<Item = (&String, &UnitRecord)> {
        self.units.iter().filter(|(_, record)| record.is_ready())
    }

    pub fn is_restoring(&self) -> bool {
        self.restore.is_some()
    }
}

/// Encode a set of unit ids for `cluster-members`
pub fn encode_members(members: &BTreeSet<String>) -> String {
    serde_json::to_string(members).unwrap_or_else(|_| "[]".to_string())
}
