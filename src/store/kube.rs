//! Kubernetes-backed store implementations
//!
//! - peer key space: one ConfigMap, compare-and-set through `resourceVersion`
//! - secrets: one Secret per application
//! - relations: labelled ConfigMaps written by the requirer, plus a
//!   `<configmap>-provider` Secret holding this side's data

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{
    Databag, PeerSnapshot, PeerStateStore, PeerVersion, PeerWrite, RelationEndpoint,
    RelationStore, SecretStore, StoreError,
};
use crate::config::OperatorConfig;
use crate::resources::FIELD_MANAGER;
use crate::resources::common::{LABEL_RELATION_ID, relation_identity, relation_selector};
use crate::resources::configmap::{decode_peer_data, encode_peer_data, peer_configmap};
use crate::resources::secret::{
    application_secret, provider_secret, provider_secret_name, secret_strings,
};

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == code)
}

/// Peer key space stored in a single ConfigMap
#[derive(Clone)]
pub struct KubePeerStore {
    api: Api<ConfigMap>,
    name: String,
    namespace: String,
    app_name: String,
}

impl KubePeerStore {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            name: config.peer_configmap_name(),
            namespace: config.namespace.clone(),
            app_name: config.app_name.clone(),
        }
    }

    /// Fetch the ConfigMap, creating it on first use
    async fn load(&self) -> Result<ConfigMap, StoreError> {
        if let Some(cm) = self.api.get_opt(&self.name).await? {
            return Ok(cm);
        }
        let cm = peer_configmap(&self.name, &self.namespace, &self.app_name);
        match self.api.create(&post_params(), &cm).await {
            Ok(created) => {
                debug!(name = %self.name, "Created peer ConfigMap");
                Ok(created)
            }
            Err(e) if is_status(&e, 409) => Ok(self.api.get(&self.name).await?),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PeerStateStore for KubePeerStore {
    async fn snapshot(&self) -> Result<PeerSnapshot, StoreError> {
        let cm = self.load().await?;
        let mut snapshot = decode_peer_data(&cm.data.clone().unwrap_or_default())?;
        snapshot.version = PeerVersion::new(cm.resource_version().unwrap_or_default());
        Ok(snapshot)
    }

    async fn apply(
        &self,
        expected: &PeerVersion,
        writes: &[PeerWrite],
    ) -> Result<PeerVersion, StoreError> {
        let mut cm = self.load().await?;
        let actual = cm.resource_version().unwrap_or_default();
        if actual != expected.as_str() {
            return Err(StoreError::Conflict {
                expected: expected.to_string(),
                actual,
            });
        }

        let mut snapshot = decode_peer_data(&cm.data.clone().unwrap_or_default())?;
        snapshot.apply_writes(writes);
        cm.data = Some(encode_peer_data(&snapshot));

        // The API server rejects the replace with 409 if the resourceVersion
        // moved since `load`.
        match self.api.replace(&self.name, &post_params(), &cm).await {
            Ok(updated) => Ok(PeerVersion::new(
                updated.resource_version().unwrap_or_default(),
            )),
            Err(e) if is_status(&e, 409) => Err(StoreError::Conflict {
                expected: expected.to_string(),
                actual: "newer".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Application secrets stored in a single Secret
#[derive(Clone)]
pub struct KubeSecretStore {
    api: Api<Secret>,
    name: String,
    namespace: String,
    app_name: String,
}

impl KubeSecretStore {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            name: config.secret_name(),
            namespace: config.namespace.clone(),
            app_name: config.app_name.clone(),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let secret = self.api.get_opt(&self.name).await?;
        Ok(secret.and_then(|s| secret_strings(&s).remove(key)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let patch = json!({ "stringData": { key: value } });
        match self
            .api
            .patch(&self.name, &patch_params(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                let secret = application_secret(
                    &self.name,
                    &self.namespace,
                    &self.app_name,
                    BTreeMap::from([(key.to_string(), value.to_string())]),
                );
                match self.api.create(&post_params(), &secret).await {
                    Ok(_) => Ok(()),
                    // Lost the creation race; the patch now applies
                    Err(e) if is_status(&e, 409) => {
                        self.api
                            .patch(&self.name, &patch_params(), &Patch::Merge(&patch))
                            .await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let patch = json!({ "data": { key: null } });
        match self
            .api
            .patch(&self.name, &patch_params(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let secret = self.api.get_opt(&self.name).await?;
        Ok(secret
            .map(|s| secret_strings(&s).into_keys().collect())
            .unwrap_or_default())
    }
}

/// Relation data bags stored in labelled ConfigMaps and provider Secrets
#[derive(Clone)]
pub struct KubeRelationStore {
    configmaps: Api<ConfigMap>,
    secrets: Api<Secret>,
    app_name: String,
    unit_prefix: String,
}

const APP_DATA_PREFIX: &str = "app.";

impl KubeRelationStore {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            configmaps: Api::namespaced(client.clone(), &config.namespace),
            secrets: Api::namespaced(client, &config.namespace),
            app_name: config.app_name.clone(),
            unit_prefix: format!("unit.{}.", config.unit_name.replace('/', "-")),
        }
    }

    async fn relation_configmap(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<ConfigMap, StoreError> {
        let selector = format!(
            "{},{}={}",
            relation_selector(&self.app_name, endpoint),
            LABEL_RELATION_ID,
            relation_id
        );
        let list = self
            .configmaps
            .list(&ListParams::default().labels(&selector))
            .await?;
        list.items
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("{}:{}", endpoint, relation_id)))
    }

    async fn read_local(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        prefix: &str,
    ) -> Result<Databag, StoreError> {
        let cm = self.relation_configmap(endpoint, relation_id).await?;
        let secret = self
            .secrets
            .get_opt(&provider_secret_name(&cm.name_any()))
            .await?;
        Ok(secret
            .map(|s| strip_prefix(secret_strings(&s), prefix))
            .unwrap_or_default())
    }

    /// Replace the keys under `prefix`, leaving other writers' keys alone
    async fn write_local(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        prefix: &str,
        data: Databag,
    ) -> Result<(), StoreError> {
        let cm = self.relation_configmap(endpoint, relation_id).await?;
        let name = provider_secret_name(&cm.name_any());
        let prefixed: BTreeMap<String, String> = data
            .into_iter()
            .map(|(k, v)| (format!("{}{}", prefix, k), v))
            .collect();

        let existing = match self.secrets.get_opt(&name).await? {
            Some(secret) => secret_strings(&secret),
            None => {
                let secret = provider_secret(&cm, &self.app_name, prefixed.clone());
                match self.secrets.create(&post_params(), &secret).await {
                    Ok(_) => return Ok(()),
                    Err(e) if is_status(&e, 409) => self
                        .secrets
                        .get_opt(&name)
                        .await?
                        .map(|s| secret_strings(&s))
                        .unwrap_or_default(),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let mut removed = Map::new();
        for key in existing.keys() {
            if key.starts_with(prefix) && !prefixed.contains_key(key) {
                removed.insert(key.clone(), Value::Null);
            }
        }
        let patch = json!({ "stringData": prefixed, "data": removed });
        self.secrets
            .patch(&name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn strip_prefix(data: BTreeMap<String, String>, prefix: &str) -> Databag {
    data.into_iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|key| (key.to_string(), v)))
        .collect()
}

#[async_trait]
impl RelationStore for KubeRelationStore {
    async fn relation_ids(&self, endpoint: RelationEndpoint) -> Result<Vec<u32>, StoreError> {
        let list = self
            .configmaps
            .list(&ListParams::default().labels(&relation_selector(&self.app_name, endpoint)))
            .await?;
        let mut ids: Vec<u32> = list
            .items
            .iter()
            .filter_map(relation_identity)
            .map(|(_, id)| id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn remote_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError> {
        let cm = self.relation_configmap(endpoint, relation_id).await?;
        Ok(cm.data.unwrap_or_default())
    }

    async fn local_app_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError> {
        self.read_local(endpoint, relation_id, APP_DATA_PREFIX).await
    }

    async fn set_local_app_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        data: Databag,
    ) -> Result<(), StoreError> {
        self.write_local(endpoint, relation_id, APP_DATA_PREFIX, data)
            .await
    }

    async fn local_unit_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError> {
        self.read_local(endpoint, relation_id, &self.unit_prefix).await
    }

    async fn set_local_unit_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        data: Databag,
    ) -> Result<(), StoreError> {
        self.write_local(endpoint, relation_id, &self.unit_prefix, data)
            .await
    }
}
