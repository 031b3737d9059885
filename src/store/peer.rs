//! Versioned peer key space shared by every unit

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::StoreError;

/// Opaque version token of a peer snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PeerVersion(String);

impl PeerVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application-wide or per-unit section of the key space
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerScope {
    App,
    Unit(String),
}

/// One key write; `None` deletes the key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerWrite {
    pub scope: PeerScope,
    pub key: String,
    pub value: Option<String>,
}

impl PeerWrite {
    pub fn app(key: &str, value: impl Into<String>) -> Self {
        Self {
            scope: PeerScope::App,
            key: key.to_string(),
            value: Some(value.into()),
        }
    }

    pub fn unit(unit: &str, key: &str, value: impl Into<String>) -> Self {
        Self {
            scope: PeerScope::Unit(unit.to_string()),
            key: key.to_string(),
            value: Some(value.into()),
        }
    }

    pub fn delete(scope: PeerScope, key: &str) -> Self {
        Self {
            scope,
            key: key.to_string(),
            value: None,
        }
    }
}

/// Consistent view of the whole key space at one version
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub version: PeerVersion,
    pub app: BTreeMap<String, String>,
    pub units: BTreeMap<String, BTreeMap<String, String>>,
}

impl PeerSnapshot {
    pub fn app_value(&self, key: &str) -> Option<&str> {
        self.app.get(key).map(String::as_str)
    }

    pub fn unit_value(&self, unit: &str, key: &str) -> Option<&str> {
        self.units
            .get(unit)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    /// Apply writes to an in-memory copy, dropping units left without keys
    pub fn apply_writes(&mut self, writes: &[PeerWrite]) {
        for write in writes {
            let entries = match &write.scope {
                PeerScope::App => &mut self.app,
                PeerScope::Unit(unit) => self.units.entry(unit.clone()).or_default(),
            };
            match &write.value {
                Some(value) => {
                    entries.insert(write.key.clone(), value.clone());
                }
                None => {
                    entries.remove(&write.key);
                }
            }
        }
        self.units.retain(|_, entries| !entries.is_empty());
    }
}

/// Shared key space with compare-and-set writes
#[async_trait]
pub trait PeerStateStore: Send + Sync {
    /// Read the whole key space
    async fn snapshot(&self) -> Result<PeerSnapshot, StoreError>;

    /// Apply `writes` atomically if the store is still at `expected`.
    ///
    /// Returns the new version, or [`StoreError::Conflict`] when another
    /// writer got there first.
    async fn apply(
        &self,
        expected: &PeerVersion,
        writes: &[PeerWrite],
    ) -> Result<PeerVersion, StoreError>;
}
