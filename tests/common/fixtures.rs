//! Test fixtures for units running against in-memory collaborators
//!
//! A [`TestDeployment`] holds everything units of one application share:
//! the peer key space, relation data, application secrets, the simulated
//! cluster and the backup bucket. Each call to [`TestDeployment::unit`]
//! returns a [`Context`] for one unit wired to those shared stores.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let deployment = TestDeployment::new();
//! let leader = deployment.unit(0, Leadership::Leader);
//! handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();
//! assert_eq!(deployment.admin.count("create_cluster"), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;
use tokio::sync::Notify;

use mysql_operator::admin::{
    AdminAccount, AdminError, ByteStream, ClusterAdmin, ClusterTopology, MemberRole, MemberStatus,
    UnitMember,
};
use mysql_operator::backup::InMemoryStoreProvider;
use mysql_operator::controller::RetryPolicy;
use mysql_operator::leadership::{Leadership, LeadershipState};
use mysql_operator::peer::PeerRecord;
use mysql_operator::relations::s3::{ACCESS_KEY, BUCKET, PATH, SECRET_KEY};
use mysql_operator::store::{
    Databag, MemoryPeerStore, MemoryRelationStore, MemorySecretStore, PeerStateStore,
    RelationEndpoint,
};
use mysql_operator::tls::IssuedCertificate;
use mysql_operator::{Collaborators, Context, OperatorConfig};

pub const APP: &str = "mysql-k8s";

/// Unit id for an ordinal
pub fn unit_name(ordinal: u32) -> String {
    format!("{}/{}", APP, ordinal)
}

// =============================================================================
// Fake cluster admin
// =============================================================================

#[derive(Debug, Default)]
struct FakeState {
    topology: ClusterTopology,
    calls: Vec<String>,
    configured: BTreeSet<String>,
    users: BTreeMap<String, String>,
    passwords: BTreeMap<String, String>,
    restored: Vec<Vec<u8>>,
    tls_reloads: usize,
    data_dir_empty: bool,
    failures: Vec<Failure>,
    /// Leadership revoked as soon as the named call is issued
    lease_loss: Option<(String, LeadershipState)>,
    /// Backup streams fail after their first chunk
    broken_backup_stream: bool,
    /// Backup streams wait for this before yielding data
    backup_gate: Option<Arc<Notify>>,
}

/// Injected failure of a named admin call
#[derive(Debug)]
struct Failure {
    call: String,
    /// Calls left to fail; `None` fails forever
    remaining: Option<usize>,
    transient: bool,
}

/// Simulated engine shared by every unit of a deployment.
///
/// Instance-local calls (`configure_instance`, `backup_to`, ...) are recorded
/// against the unit the handle was created for.
#[derive(Clone, Debug)]
pub struct FakeClusterAdmin {
    unit: String,
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeClusterAdmin {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClusterAdmin {
    pub fn new() -> Self {
        Self {
            unit: unit_name(0),
            state: Arc::new(Mutex::new(FakeState {
                data_dir_empty: true,
                ..Default::default()
            })),
        }
    }

    /// Handle on the same engine as seen from `unit`
    pub fn for_unit(&self, unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            state: self.state.clone(),
        }
    }

    fn record(&self, call: &str) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_string());
        if let Some((lost_on, leadership)) = &state.lease_loss
            && lost_on == call
        {
            leadership.set(Leadership::Follower);
        }
        let Some(index) = state.failures.iter().position(|f| f.call == call) else {
            return Ok(());
        };
        let failure = &mut state.failures[index];
        let error = if failure.transient {
            AdminError::Transient(format!("injected {} failure", call))
        } else {
            AdminError::CommandFailed(format!("injected {} failure", call))
        };
        let exhausted = match &mut failure.remaining {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            state.failures.remove(index);
        }
        Err(error)
    }

    /// Fail the next `times` calls named `call` with a transient error
    pub fn fail_transient(&self, call: &str, times: usize) {
        self.push_failure(call, Some(times), true);
    }

    /// Fail every call named `call` with a command error
    pub fn fail_always(&self, call: &str) {
        self.push_failure(call, None, false);
    }

    fn push_failure(&self, call: &str, remaining: Option<usize>, transient: bool) {
        self.state.lock().unwrap().failures.push(Failure {
            call: call.to_string(),
            remaining,
            transient,
        });
    }

    /// Drop `leadership` to follower when `call` is next issued
    pub fn lose_lease_on(&self, call: &str, leadership: &LeadershipState) {
        self.state.lock().unwrap().lease_loss = Some((call.to_string(), leadership.clone()));
    }

    /// Make backup streams break partway through
    pub fn break_backup_stream(&self) {
        self.state.lock().unwrap().broken_backup_stream = true;
    }

    /// Hold backup streams until the returned gate is notified
    pub fn gate_backup_stream(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().backup_gate = Some(gate.clone());
        gate
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn topology(&self) -> ClusterTopology {
        self.state.lock().unwrap().topology.clone()
    }

    pub fn set_topology(&self, topology: ClusterTopology) {
        self.state.lock().unwrap().topology = topology;
    }

    pub fn set_member_status(&self, unit: &str, role: MemberRole, status: MemberStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(member) = state.topology.member_mut(unit) {
            member.role = role;
            member.status = status;
        }
    }

    pub fn set_data_dir_empty(&self, empty: bool) {
        self.state.lock().unwrap().data_dir_empty = empty;
    }

    pub fn is_configured(&self, unit: &str) -> bool {
        self.state.lock().unwrap().configured.contains(unit)
    }

    pub fn user(&self, username: &str) -> Option<String> {
        self.state.lock().unwrap().users.get(username).cloned()
    }

    pub fn password(&self, username: &str) -> Option<String> {
        self.state.lock().unwrap().passwords.get(username).cloned()
    }

    /// Bytes of each stream passed to the last restore, full backup first
    pub fn restored(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().restored.clone()
    }

    pub fn tls_reloads(&self) -> usize {
        self.state.lock().unwrap().tls_reloads
    }
}

/// Bytes a fake backup of `backup_id` streams
pub fn backup_payload(backup_id: &str) -> Vec<u8> {
    format!("xbstream:{}", backup_id).into_bytes()
}

#[async_trait]
impl ClusterAdmin for FakeClusterAdmin {
    async fn create_cluster(
        &self,
        _cluster_name: &str,
        unit: &str,
        address: &str,
    ) -> Result<(), AdminError> {
        self.record("create_cluster")?;
        let mut state = self.state.lock().unwrap();
        if !state.topology.is_empty() {
            return Err(AdminError::CommandFailed("cluster already exists".into()));
        }
        state.topology.insert(UnitMember::new(
            unit,
            address,
            MemberRole::ReadWrite,
            MemberStatus::Online,
        ));
        Ok(())
    }

    async fn add_instance(
        &self,
        _cluster_name: &str,
        unit: &str,
        address: &str,
    ) -> Result<(), AdminError> {
        self.record("add_instance")?;
        self.state.lock().unwrap().topology.insert(UnitMember::new(
            unit,
            address,
            MemberRole::ReadOnly,
            MemberStatus::Online,
        ));
        Ok(())
    }

    async fn remove_instance(
        &self,
        _cluster_name: &str,
        address: &str,
        _force: bool,
    ) -> Result<(), AdminError> {
        self.record("remove_instance")?;
        let mut state = self.state.lock().unwrap();
        let unit = state
            .topology
            .members()
            .find(|m| m.address == address)
            .map(|m| m.unit_id.clone());
        if let Some(unit) = unit {
            state.topology.remove(&unit);
        }
        Ok(())
    }

    async fn cluster_status(
        &self,
        _cluster_name: &str,
    ) -> Result<Option<ClusterTopology>, AdminError> {
        let topology = self.state.lock().unwrap().topology.clone();
        Ok((!topology.is_empty()).then_some(topology))
    }

    async fn elect_primary(&self, _cluster_name: &str) -> Result<(), AdminError> {
        self.record("elect_primary")?;
        let mut state = self.state.lock().unwrap();
        let candidate = state
            .topology
            .members()
            .find(|m| m.is_online_secondary())
            .map(|m| m.unit_id.clone());
        if let Some(unit) = candidate
            && let Some(member) = state.topology.member_mut(&unit)
        {
            member.role = MemberRole::ReadWrite;
        }
        Ok(())
    }

    async fn configure_instance(&self, accounts: &[AdminAccount]) -> Result<(), AdminError> {
        self.record("configure_instance")?;
        let mut state = self.state.lock().unwrap();
        state.configured.insert(self.unit.clone());
        for account in accounts {
            state
                .passwords
                .insert(account.username.clone(), account.password.clone());
        }
        Ok(())
    }

    async fn create_scoped_user(
        &self,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AdminError> {
        self.record("create_scoped_user")?;
        let mut state = self.state.lock().unwrap();
        state.users.insert(username.to_string(), database.to_string());
        state
            .passwords
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn drop_scoped_user(&self, username: &str) -> Result<(), AdminError> {
        self.record("drop_scoped_user")?;
        let mut state = self.state.lock().unwrap();
        state.users.remove(username);
        state.passwords.remove(username);
        Ok(())
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<(), AdminError> {
        self.record("set_password")?;
        self.state
            .lock()
            .unwrap()
            .passwords
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn server_version(&self) -> Result<String, AdminError> {
        Ok("8.0.36-0ubuntu0.22.04.1".to_string())
    }

    async fn data_dir_empty(&self) -> Result<bool, AdminError> {
        Ok(self.state.lock().unwrap().data_dir_empty)
    }

    async fn backup_to(
        &self,
        backup_id: &str,
        _incremental_base: Option<&str>,
    ) -> Result<ByteStream, AdminError> {
        self.record("backup_to")?;
        let payload = Bytes::from(backup_payload(backup_id));
        let (broken, gate) = {
            let state = self.state.lock().unwrap();
            (state.broken_backup_stream, state.backup_gate.clone())
        };
        if broken {
            let head = payload.slice(..payload.len() / 2);
            return Ok(futures::stream::iter(vec![
                Ok(head),
                Err(AdminError::Transient("connection reset mid-stream".into())),
            ])
            .boxed());
        }
        match gate {
            Some(gate) => Ok(futures::stream::once(async move {
                gate.notified().await;
                Ok(payload)
            })
            .boxed()),
            None => Ok(futures::stream::iter(vec![Ok(payload)]).boxed()),
        }
    }

    async fn restore_from(&self, chain: Vec<ByteStream>) -> Result<(), AdminError> {
        self.record("restore_from")?;
        let mut restored = Vec::with_capacity(chain.len());
        for mut stream in chain {
            let mut bytes = Vec::new();
            while let Some(chunk) = stream.next().await {
                bytes.extend_from_slice(&chunk?);
            }
            restored.push(bytes);
        }
        self.state.lock().unwrap().restored = restored;
        Ok(())
    }

    async fn reload_tls(&self) -> Result<(), AdminError> {
        self.record("reload_tls")?;
        self.state.lock().unwrap().tls_reloads += 1;
        Ok(())
    }
}

// =============================================================================
// Deployment harness
// =============================================================================

/// Shared state of one application's units
pub struct TestDeployment {
    pub peers: MemoryPeerStore,
    pub relations: MemoryRelationStore,
    pub secrets: MemorySecretStore,
    pub admin: FakeClusterAdmin,
    pub storage: InMemoryStoreProvider,
    pub data_root: TempDir,
}

impl Default for TestDeployment {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDeployment {
    pub fn new() -> Self {
        Self {
            peers: MemoryPeerStore::new(),
            relations: MemoryRelationStore::new(&unit_name(0)),
            secrets: MemorySecretStore::new(),
            admin: FakeClusterAdmin::new(),
            storage: InMemoryStoreProvider::new(),
            data_root: TempDir::new().unwrap(),
        }
    }

    pub fn config(&self, ordinal: u32) -> OperatorConfig {
        let mut config = OperatorConfig::new(APP, ordinal, "test");
        config.data_dir = self.data_root.path().join(format!("unit-{}", ordinal));
        config.retry = RetryPolicy::immediate(2);
        config
    }

    /// Context of unit `ordinal` with the given leadership
    pub fn unit(&self, ordinal: u32, leadership: Leadership) -> Context {
        let config = self.config(ordinal);
        std::fs::create_dir_all(&config.data_dir).unwrap();
        let unit = config.unit_name.clone();
        let collaborators = Collaborators {
            peer_store: Arc::new(self.peers.clone()),
            relations: Arc::new(self.relations.for_unit(&unit)),
            secrets: Arc::new(self.secrets.clone()),
            admin: Arc::new(self.admin.for_unit(&unit)),
            object_stores: Arc::new(self.storage.clone()),
        };
        Context::new(config, collaborators, LeadershipState::new(leadership), None)
    }

    pub async fn record(&self) -> PeerRecord {
        PeerRecord::from_snapshot(&self.peers.snapshot().await.unwrap()).unwrap()
    }

    /// Relate an object storage integrator with usable parameters
    pub async fn relate_s3(&self, relation_id: u32) {
        self.relations
            .set_remote_data(
                RelationEndpoint::S3Parameters,
                relation_id,
                databag(&[
                    (BUCKET, "backups"),
                    (ACCESS_KEY, "access"),
                    (SECRET_KEY, "secret"),
                    (PATH, "mysql"),
                ]),
            )
            .await;
    }
}

pub fn databag(pairs: &[(&str, &str)]) -> Databag {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Topology with `primary` as the online primary and the rest online secondaries
pub fn live_topology(primary: &str, secondaries: &[&str]) -> ClusterTopology {
    let address = |unit: &str| format!("{}.{}-endpoints", unit.replace('/', "-"), APP);
    let mut topology = ClusterTopology::new();
    topology.insert(UnitMember::new(
        primary,
        &address(primary),
        MemberRole::ReadWrite,
        MemberStatus::Online,
    ));
    for unit in secondaries {
        topology.insert(UnitMember::new(
            unit,
            &address(unit),
            MemberRole::ReadOnly,
            MemberStatus::Online,
        ));
    }
    topology
}

// =============================================================================
// Certificate authority
// =============================================================================

/// Self-signed CA able to sign certificates for pending requests
pub struct TestAuthority {
    pub cert_pem: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestAuthority {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_pem: cert.pem(),
            cert,
            key,
        }
    }

    /// Certificate for the holder of `key_pem` with rcgen's default validity
    pub fn sign(&self, key_pem: &str, sans: &[&str]) -> String {
        self.sign_with(key_pem, sans, |_| {})
    }

    /// Certificate that expired long ago
    pub fn sign_expired(&self, key_pem: &str, sans: &[&str]) -> String {
        self.sign_with(key_pem, sans, |params| {
            params.not_before = rcgen::date_time_ymd(2000, 1, 1);
            params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        })
    }

    fn sign_with(
        &self,
        key_pem: &str,
        sans: &[&str],
        adjust: impl FnOnce(&mut CertificateParams),
    ) -> String {
        let key = KeyPair::from_pem(key_pem).unwrap();
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        adjust(&mut params);
        params.signed_by(&key, &self.cert, &self.key).unwrap().pem()
    }

    /// Databag entry answering `csr_pem` with `certificate`
    pub fn issued(&self, csr_pem: &str, certificate: String) -> IssuedCertificate {
        IssuedCertificate {
            certificate_signing_request: csr_pem.to_string(),
            certificate,
            ca: self.cert_pem.clone(),
            chain: vec![self.cert_pem.clone()],
        }
    }
}

/// Publish issued certificates on a certificates relation
pub async fn publish_certificates(
    relations: &MemoryRelationStore,
    relation_id: u32,
    issued: &[IssuedCertificate],
) {
    relations
        .set_remote_data(
            RelationEndpoint::Certificates,
            relation_id,
            databag(&[(
                mysql_operator::tls::CERTIFICATES_KEY,
                &serde_json::to_string(issued).unwrap(),
            )]),
        )
        .await;
}
