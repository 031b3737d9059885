//! Events consumed by the unit's reconciliation entry point

use tokio::sync::oneshot;

use crate::admin::ClusterTopology;
use crate::backup::{BackupKind, BackupManifest, RestoreOutcome};
use crate::controller::error::Result;
use crate::credentials::SystemUser;
use crate::store::RelationEndpoint;

/// Channel on which an operator action receives its outcome
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Everything that can make a unit reconsider its state
#[derive(Debug)]
pub enum UnitEvent {
    /// The peer key space changed
    PeerChanged,
    /// A relation was established or its remote data changed
    RelationChanged {
        endpoint: RelationEndpoint,
        relation_id: u32,
    },
    /// A relation was torn down
    RelationBroken {
        endpoint: RelationEndpoint,
        relation_id: u32,
    },
    /// The certificate authority published certificates on a relation
    CertIssued { relation_id: u32 },
    LeaderElected,
    LeadershipLost,
    /// This unit is being scaled away
    Departing,
    BackupRequested {
        kind: BackupKind,
        reply: Option<Reply<BackupManifest>>,
    },
    ListBackupsRequested {
        reply: Reply<Vec<BackupManifest>>,
    },
    RestoreRequested {
        backup_id: String,
        force: bool,
        reply: Option<Reply<RestoreOutcome>>,
    },
    PasswordRotationRequested {
        user: SystemUser,
        password: Option<String>,
        reply: Option<Reply<()>>,
    },
    ClusterStatusRequested {
        reply: Reply<Option<ClusterTopology>>,
    },
    /// Periodic status tick
    UpdateStatus,
}

impl UnitEvent {
    /// Short name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            UnitEvent::PeerChanged => "peer-changed",
            UnitEvent::RelationChanged { .. } => "relation-changed",
            UnitEvent::RelationBroken { .. } => "relation-broken",
            UnitEvent::CertIssued { .. } => "cert-issued",
            UnitEvent::LeaderElected => "leader-elected",
            UnitEvent::LeadershipLost => "leadership-lost",
            UnitEvent::Departing => "departing",
            UnitEvent::BackupRequested { .. } => "backup-requested",
            UnitEvent::ListBackupsRequested { .. } => "list-backups-requested",
            UnitEvent::RestoreRequested { .. } => "restore-requested",
            UnitEvent::PasswordRotationRequested { .. } => "password-rotation-requested",
            UnitEvent::ClusterStatusRequested { .. } => "cluster-status-requested",
            UnitEvent::UpdateStatus => "update-status",
        }
    }

    /// Whether the event can be retried later without an operator waiting on it
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            UnitEvent::PeerChanged
                | UnitEvent::RelationChanged { .. }
                | UnitEvent::RelationBroken { .. }
                | UnitEvent::CertIssued { .. }
                | UnitEvent::LeaderElected
                | UnitEvent::UpdateStatus
        )
    }

    /// Copy of a requeueable event; `None` for events carrying a reply channel
    pub fn requeue_copy(&self) -> Option<UnitEvent> {
        match self {
            UnitEvent::PeerChanged => Some(UnitEvent::PeerChanged),
            UnitEvent::RelationChanged {
                endpoint,
                relation_id,
            } => Some(UnitEvent::RelationChanged {
                endpoint: *endpoint,
                relation_id: *relation_id,
            }),
            UnitEvent::RelationBroken {
                endpoint,
                relation_id,
            } => Some(UnitEvent::RelationBroken {
                endpoint: *endpoint,
                relation_id: *relation_id,
            }),
            UnitEvent::CertIssued { relation_id } => Some(UnitEvent::CertIssued {
                relation_id: *relation_id,
            }),
            UnitEvent::LeaderElected => Some(UnitEvent::LeaderElected),
            UnitEvent::UpdateStatus => Some(UnitEvent::UpdateStatus),
            _ => None,
        }
    }
}
