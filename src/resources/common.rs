//! Common utilities for Kubernetes resource generation
//!
//! Labels, selectors and owner references shared by every object the unit
//! process reads or writes.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::store::RelationEndpoint;

/// Operator field manager name for API writes
pub const FIELD_MANAGER: &str = "mysql-operator";

/// Label carrying the application name
pub const LABEL_APP: &str = "app.kubernetes.io/name";

/// Label marking a ConfigMap as a relation data bag
pub const LABEL_RELATION_ENDPOINT: &str = "mysql-operator.io/relation-endpoint";

/// Label carrying the relation id
pub const LABEL_RELATION_ID: &str = "mysql-operator.io/relation-id";

/// Standard labels for all objects belonging to an application
pub fn standard_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), app_name.to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            "mysql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// Label selector matching every relation data bag of an endpoint
pub fn relation_selector(app_name: &str, endpoint: RelationEndpoint) -> String {
    format!(
        "{}={},{}={}",
        LABEL_APP,
        app_name,
        LABEL_RELATION_ENDPOINT,
        endpoint.name()
    )
}

/// Label selector matching every relation data bag of the application
pub fn all_relations_selector(app_name: &str) -> String {
    format!("{}={},{}", LABEL_APP, app_name, LABEL_RELATION_ENDPOINT)
}

/// Parse endpoint and relation id from a relation object's labels
pub fn relation_identity<K: ResourceExt>(obj: &K) -> Option<(RelationEndpoint, u32)> {
    let labels = obj.labels();
    let endpoint = RelationEndpoint::from_name(labels.get(LABEL_RELATION_ENDPOINT)?)?;
    let id = labels.get(LABEL_RELATION_ID)?.parse().ok()?;
    Some((endpoint, id))
}

/// Owner reference making `owner` garbage-collect the dependent object
pub fn owner_reference<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let meta = owner.meta();
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}
