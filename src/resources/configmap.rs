//! Peer key space ConfigMap encoding
//!
//! The whole peer key space lives in one ConfigMap so that a single
//! `resourceVersion` versions it. Keys are flattened as `app.<key>` and
//! `unit.<app>_<ordinal>.<key>`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;

use crate::resources::common::standard_labels;
use crate::store::{PeerSnapshot, StoreError};

const APP_PREFIX: &str = "app.";
const UNIT_PREFIX: &str = "unit.";

/// Generate an empty peer ConfigMap
pub fn peer_configmap(name: &str, namespace: &str, app_name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(standard_labels(app_name)),
            ..Default::default()
        },
        data: Some(BTreeMap::new()),
        ..Default::default()
    }
}

/// `mysql-k8s/0` -> `mysql-k8s_0`
fn encode_unit(unit: &str) -> String {
    unit.replace('/', "_")
}

/// `mysql-k8s_0` -> `mysql-k8s/0`
fn decode_unit(encoded: &str) -> Option<String> {
    let (app, ordinal) = encoded.rsplit_once('_')?;
    Some(format!("{}/{}", app, ordinal))
}

/// Flatten a peer snapshot into ConfigMap data
pub fn encode_peer_data(snapshot: &PeerSnapshot) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for (key, value) in &snapshot.app {
        data.insert(format!("{}{}", APP_PREFIX, key), value.clone());
    }
    for (unit, entries) in &snapshot.units {
        let encoded = encode_unit(unit);
        for (key, value) in entries {
            data.insert(format!("{}{}.{}", UNIT_PREFIX, encoded, key), value.clone());
        }
    }
    data
}

/// Rebuild a peer snapshot from ConfigMap data; the version is left empty
pub fn decode_peer_data(data: &BTreeMap<String, String>) -> Result<PeerSnapshot, StoreError> {
    let mut snapshot = PeerSnapshot::default();
    for (flat, value) in data {
        if let Some(key) = flat.strip_prefix(APP_PREFIX) {
            snapshot.app.insert(key.to_string(), value.clone());
        } else if let Some(rest) = flat.strip_prefix(UNIT_PREFIX) {
            let (encoded, key) = rest
                .split_once('.')
                .ok_or_else(|| StoreError::Invalid(format!("malformed peer key: {}", flat)))?;
            let unit = decode_unit(encoded)
                .ok_or_else(|| StoreError::Invalid(format!("malformed unit in key: {}", flat)))?;
            snapshot
                .units
                .entry(unit)
                .or_default()
                .insert(key.to_string(), value.clone());
        } else {
            return Err(StoreError::Invalid(format!("unknown peer key: {}", flat)));
        }
    }
    Ok(snapshot)
}
