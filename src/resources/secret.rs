use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::resources::common::{owner_reference, standard_labels};

/// Suffix of the Secret holding this side's data for a relation
pub const PROVIDER_SECRET_SUFFIX: &str = "-provider";

/// Generate the application secret store Secret
pub fn application_secret(
    name: &str,
    namespace: &str,
    app_name: &str,
    string_data: BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(standard_labels(app_name)),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Name of the Secret carrying this side's data for a relation ConfigMap
pub fn provider_secret_name(relation_configmap: &str) -> String {
    format!("{}{}", relation_configmap, PROVIDER_SECRET_SUFFIX)
}

/// Generate the Secret carrying this side's data for a relation.
///
/// The Secret is owned by the relation ConfigMap, so removing the relation
/// removes the published credentials with it.
pub fn provider_secret(
    relation: &ConfigMap,
    app_name: &str,
    string_data: BTreeMap<String, String>,
) -> Secret {
    let mut labels = relation.labels().clone();
    labels.extend(standard_labels(app_name));
    Secret {
        metadata: ObjectMeta {
            name: Some(provider_secret_name(&relation.name_any())),
            namespace: relation.namespace(),
            labels: Some(labels),
            owner_references: owner_reference(relation).map(|owner| vec![owner]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Decode Secret data into strings, skipping values that are not UTF-8
pub fn secret_strings(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .iter()
        .flatten()
        .filter_map(|(key, value)| {
            String::from_utf8(value.0.clone())
                .ok()
                .map(|text| (key.clone(), text))
        })
        .collect()
}
