//! In-memory store implementations
//!
//! Used by tests and by single-process simulations of a deployment. Clones
//! share state, so several units can be pointed at the same peer store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    Databag, PeerSnapshot, PeerStateStore, PeerVersion, PeerWrite, RelationEndpoint,
    RelationStore, SecretStore, StoreError,
};

#[derive(Debug, Default)]
struct PeerInner {
    version: u64,
    snapshot: PeerSnapshot,
}

/// Peer key space held in memory with a monotonically increasing version
#[derive(Clone, Debug, Default)]
pub struct MemoryPeerStore {
    inner: Arc<Mutex<PeerInner>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the version without changing data, as a concurrent writer would
    pub async fn touch(&self) {
        let mut inner = self.inner.lock().await;
        inner.version += 1;
        inner.snapshot.version = PeerVersion::new(inner.version.to_string());
    }
}

#[async_trait]
impl PeerStateStore for MemoryPeerStore {
    async fn snapshot(&self) -> Result<PeerSnapshot, StoreError> {
        let inner = self.inner.lock().await;
        let mut snapshot = inner.snapshot.clone();
        snapshot.version = PeerVersion::new(inner.version.to_string());
        Ok(snapshot)
    }

    async fn apply(
        &self,
        expected: &PeerVersion,
        writes: &[PeerWrite],
    ) -> Result<PeerVersion, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner.version.to_string();
        if expected.as_str() != current {
            return Err(StoreError::Conflict {
                expected: expected.to_string(),
                actual: current,
            });
        }
        inner.snapshot.apply_writes(writes);
        inner.version += 1;
        let version = PeerVersion::new(inner.version.to_string());
        inner.snapshot.version = version.clone();
        Ok(version)
    }
}

#[derive(Debug, Default)]
struct RelationsInner {
    established: BTreeSet<(RelationEndpoint, u32)>,
    remote: BTreeMap<(RelationEndpoint, u32), Databag>,
    local_app: BTreeMap<(RelationEndpoint, u32), Databag>,
    local_unit: BTreeMap<(RelationEndpoint, u32, String), Databag>,
}

/// Relation data bags held in memory, viewed from one unit
#[derive(Clone, Debug)]
pub struct MemoryRelationStore {
    unit: String,
    inner: Arc<Mutex<RelationsInner>>,
}

impl MemoryRelationStore {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            inner: Arc::default(),
        }
    }

    /// View of the same relations from another unit
    pub fn for_unit(&self, unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            inner: self.inner.clone(),
        }
    }

    /// Establish a relation, as the remote application joining would
    pub async fn join(&self, endpoint: RelationEndpoint, relation_id: u32) {
        self.inner
            .lock()
            .await
            .established
            .insert((endpoint, relation_id));
    }

    /// Tear a relation down together with both sides' data
    pub async fn depart(&self, endpoint: RelationEndpoint, relation_id: u32) {
        let mut inner = self.inner.lock().await;
        inner.established.remove(&(endpoint, relation_id));
        inner.remote.remove(&(endpoint, relation_id));
        inner.local_app.remove(&(endpoint, relation_id));
        inner
            .local_unit
            .retain(|(e, id, _), _| !(*e == endpoint && *id == relation_id));
    }

    /// Publish data from the remote side
    pub async fn set_remote_data(&self, endpoint: RelationEndpoint, relation_id: u32, data: Databag) {
        let mut inner = self.inner.lock().await;
        inner.established.insert((endpoint, relation_id));
        inner.remote.insert((endpoint, relation_id), data);
    }
}

#[async_trait]
impl RelationStore for MemoryRelationStore {
    async fn relation_ids(&self, endpoint: RelationEndpoint) -> Result<Vec<u32>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .established
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, id)| *id)
            .collect())
    }

    async fn remote_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .remote
            .get(&(endpoint, relation_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn local_app_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .local_app
            .get(&(endpoint, relation_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_local_app_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        data: Databag,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.established.contains(&(endpoint, relation_id)) {
            return Err(StoreError::NotFound(format!("{}:{}", endpoint, relation_id)));
        }
        inner.local_app.insert((endpoint, relation_id), data);
        Ok(())
    }

    async fn local_unit_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .local_unit
            .get(&(endpoint, relation_id, self.unit.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_local_unit_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        data: Databag,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.established.contains(&(endpoint, relation_id)) {
            return Err(StoreError::NotFound(format!("{}:{}", endpoint, relation_id)));
        }
        inner
            .local_unit
            .insert((endpoint, relation_id, self.unit.clone()), data);
        Ok(())
    }
}

/// Secrets held in memory
#[derive(Clone, Debug, Default)]
pub struct MemorySecretStore {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().await.keys().cloned().collect())
    }
}
