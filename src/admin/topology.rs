//! Live cluster topology as reported by the admin client

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AdminError;

/// Replication role of a member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberRole {
    ReadWrite,
    ReadOnly,
    Unknown,
}

impl MemberRole {
    /// Map the engine's `mode` field
    pub fn from_mode(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "r/w" => MemberRole::ReadWrite,
            "r/o" => MemberRole::ReadOnly,
            _ => MemberRole::Unknown,
        }
    }
}

/// Health of a member from the cluster's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberStatus {
    Online,
    Recovering,
    Offline,
    Unreachable,
    Missing,
}

impl MemberStatus {
    /// Map the engine's `status` field
    pub fn from_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "online" => MemberStatus::Online,
            "recovering" => MemberStatus::Recovering,
            "offline" => MemberStatus::Offline,
            "unreachable" | "error" => MemberStatus::Unreachable,
            _ => MemberStatus::Missing,
        }
    }

    /// Statuses that make a member a removal candidate once its heartbeat is stale
    pub fn is_absent(self) -> bool {
        matches!(
            self,
            MemberStatus::Missing | MemberStatus::Unreachable | MemberStatus::Offline
        )
    }
}

/// One instance in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMember {
    pub unit_id: String,
    pub address: String,
    pub role: MemberRole,
    pub status: MemberStatus,
}

impl UnitMember {
    pub fn new(unit_id: &str, address: &str, role: MemberRole, status: MemberStatus) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            address: address.to_string(),
            role,
            status,
        }
    }

    pub fn is_online_primary(&self) -> bool {
        self.role == MemberRole::ReadWrite && self.status == MemberStatus::Online
    }

    pub fn is_online_secondary(&self) -> bool {
        self.role == MemberRole::ReadOnly && self.status == MemberStatus::Online
    }
}

/// Members of a live cluster keyed by unit id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    members: BTreeMap<String, UnitMember>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the admin client's status document.
    ///
    /// Members live under `defaultreplicaset.topology.<unit>` with `address`,
    /// `mode` and `status` fields.
    pub fn from_status(document: &Value) -> Result<Self, AdminError> {
        let topology = document
            .get("defaultreplicaset")
            .and_then(|rs| rs.get("topology"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                AdminError::Parse("status has no defaultreplicaset.topology".to_string())
            })?;

        let mut parsed = Self::new();
        for (unit_id, member) in topology {
            parsed.insert(UnitMember::new(
                unit_id,
                str_field(member, "address"),
                MemberRole::from_mode(str_field(member, "mode")),
                MemberStatus::from_status(str_field(member, "status")),
            ));
        }
        Ok(parsed)
    }

    /// Parse the status document from its JSON text
    pub fn parse(text: &str) -> Result<Self, AdminError> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| AdminError::Parse(format!("status is not JSON: {}", e)))?;
        Self::from_status(&document)
    }

    pub fn insert(&mut self, member: UnitMember) {
        self.members.insert(member.unit_id.clone(), member);
    }

    pub fn remove(&mut self, unit_id: &str) -> Option<UnitMember> {
        self.members.remove(unit_id)
    }

    pub fn member(&self, unit_id: &str) -> Option<&UnitMember> {
        self.members.get(unit_id)
    }

    pub fn member_mut(&mut self, unit_id: &str) -> Option<&mut UnitMember> {
        self.members.get_mut(unit_id)
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.members.contains_key(unit_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &UnitMember> {
        self.members.values()
    }

    pub fn unit_ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The online read-write member, if any.
    ///
    /// More than one is a corrupted topology.
    pub fn primary(&self) -> Result<Option<&UnitMember>, AdminError> {
        let mut primaries = self.members().filter(|m| m.is_online_primary());
        let first = primaries.next();
        if let Some(second) = primaries.next() {
            return Err(AdminError::CorruptTopology(format!(
                "multiple online read-write members: {} and {}",
                first.map(|m| m.unit_id.as_str()).unwrap_or_default(),
                second.unit_id
            )));
        }
        Ok(first)
    }

    /// Count of members the engine currently reports online
    pub fn online_count(&self) -> usize {
        self.members()
            .filter(|m| m.status == MemberStatus::Online)
            .count()
    }
}

fn str_field<'a>(member: &'a Value, name: &str) -> &'a str {
    member.get(name).and_then(Value::as_str).unwrap_or_default()
}
