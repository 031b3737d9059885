use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::admin::ClusterAdmin;
use crate::backup::{BackupOrchestrator, ObjectStoreProvider};
use crate::config::OperatorConfig;
use crate::controller::error::BackoffConfig;
use crate::controller::membership::MembershipPolicy;
use crate::controller::status::StatusManager;
use crate::credentials::CredentialStore;
use crate::health::{HealthState, Metrics};
use crate::leadership::LeadershipState;
use crate::peer::PeerState;
use crate::relations::DatabaseProvider;
use crate::store::{PeerStateStore, RelationStore, SecretStore};
use crate::tls::TlsManager;

/// External systems a unit talks to
#[derive(Clone)]
pub struct Collaborators {
    pub peer_store: Arc<dyn PeerStateStore>,
    pub relations: Arc<dyn RelationStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub admin: Arc<dyn ClusterAdmin>,
    pub object_stores: Arc<dyn ObjectStoreProvider>,
}

/// Shared context for the unit reconciler
#[derive(Clone)]
pub struct Context {
    pub config: OperatorConfig,
    pub peers: PeerState,
    pub relations: Arc<dyn RelationStore>,
    pub credentials: CredentialStore,
    pub admin: Arc<dyn ClusterAdmin>,
    pub database: DatabaseProvider,
    pub tls: TlsManager,
    pub backups: BackupOrchestrator,
    pub leadership: LeadershipState,
    pub status: Arc<StatusManager>,
    /// Health state for readiness and metrics, absent in tests
    pub health: Option<Arc<HealthState>>,
    /// Delays before requeued events are handled again
    pub backoff: BackoffConfig,
    /// Set once this unit announced its departure; never cleared
    departing: Arc<AtomicBool>,
}

impl Context {
    pub fn new(
        config: OperatorConfig,
        collaborators: Collaborators,
        leadership: LeadershipState,
        health: Option<Arc<HealthState>>,
    ) -> Self {
        let Collaborators {
            peer_store,
            relations,
            secrets,
            admin,
            object_stores,
        } = collaborators;

        let peers = PeerState::new(peer_store, &config.unit_name);
        let credentials = CredentialStore::new(secrets.clone());
        let database = DatabaseProvider::new(
            relations.clone(),
            credentials.clone(),
            admin.clone(),
            config.retry.clone(),
            config.primary_endpoint(),
            config.replicas_endpoint(),
        );
        let tls = TlsManager::new(
            config.data_dir.clone(),
            &config.unit_name,
            vec![config.unit_address.clone(), config.pod_name()],
            secrets,
            relations.clone(),
            admin.clone(),
            config.retry.clone(),
        );
        let backups = BackupOrchestrator::new(
            peers.clone(),
            relations.clone(),
            admin.clone(),
            object_stores,
            config.retry.clone(),
            config.lock_staleness,
        );

        Self {
            peers,
            relations,
            credentials,
            admin,
            database,
            tls,
            backups,
            leadership,
            status: Arc::new(StatusManager::new()),
            health,
            backoff: BackoffConfig::default(),
            departing: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.health.as_ref().map(|h| &h.metrics)
    }

    /// Whether this process announced its unit's departure
    pub fn is_departing(&self) -> bool {
        self.departing.load(Ordering::SeqCst)
    }

    pub fn mark_departing(&self) {
        self.departing.store(true, Ordering::SeqCst);
    }

    pub fn membership_policy(&self) -> MembershipPolicy {
        MembershipPolicy {
            unit: self.config.unit_name.clone(),
            cluster_name: self.config.cluster_name.clone(),
            departure_grace: self.config.departure_grace,
        }
    }
}
