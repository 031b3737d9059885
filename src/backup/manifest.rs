//! Backup manifests and their object-storage layout

use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};

/// Object holding the streamed backup next to its manifest
pub const DATA_OBJECT: &str = "backup.xbstream";
pub const MANIFEST_OBJECT: &str = "manifest.json";

const BACKUP_ID_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    InProgress,
    Complete,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    #[default]
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one backup, stored as `<prefix>/<backup_id>/manifest.json`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub source_unit: String,
    pub size_bytes: u64,
    pub status: BackupStatus,
    pub kind: BackupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup_id: Option<String>,
}

impl BackupManifest {
    /// A new in-progress manifest; the id is derived from `created_at`
    pub fn start(
        source_unit: &str,
        kind: BackupKind,
        base_backup_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            backup_id: backup_id_at(created_at),
            created_at,
            source_unit: source_unit.to_string(),
            size_bytes: 0,
            status: BackupStatus::InProgress,
            kind,
            base_backup_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == BackupStatus::Complete
    }
}

/// Backup id for a backup started at `at`, e.g. `2024-03-01T12-30-00Z`
pub fn backup_id_at(at: DateTime<Utc>) -> String {
    at.format(BACKUP_ID_FORMAT).to_string()
}

/// Where a deployment's backups live inside the bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupLayout {
    prefix: String,
}

impl BackupLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Prefix under which every backup directory sits
    pub fn root(&self) -> Option<ObjectPath> {
        (!self.prefix.is_empty()).then(|| ObjectPath::from(self.prefix.as_str()))
    }

    fn object(&self, backup_id: &str, name: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(format!("{}/{}", backup_id, name))
        } else {
            ObjectPath::from(format!("{}/{}/{}", self.prefix, backup_id, name))
        }
    }

    pub fn manifest(&self, backup_id: &str) -> ObjectPath {
        self.object(backup_id, MANIFEST_OBJECT)
    }

    pub fn data(&self, backup_id: &str) -> ObjectPath {
        self.object(backup_id, DATA_OBJECT)
    }

    /// Whether a listed object is a manifest
    pub fn is_manifest(path: &ObjectPath) -> bool {
        path.filename() == Some(MANIFEST_OBJECT)
    }
}

/// Result of a restore request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RestoreOutcome {
    /// The data directory now holds the backup
    Completed { backup_id: String },
    /// Waiting for the cluster to shrink to the restoring unit
    Pending { backup_id: String, reason: String },
}
