//! Ownership tags on cloud resources.

use std::collections::BTreeMap;

use serde_json::Value;

pub const CLUSTER_TAG_PREFIX: &str = "stratus.io_cluster_";
pub const OWNED: &str = "owned";

pub fn owned_tag_key(cluster_name: &str) -> String {
    format!("{CLUSTER_TAG_PREFIX}{cluster_name}")
}

/// Tags every resource created for `cluster_name` carries.
pub fn owned_tags(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(owned_tag_key(cluster_name), OWNED.to_string())])
}

/// `additional` plus the ownership tag, which always wins.
pub fn build_tags(cluster_name: &str, additional: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut tags = additional.clone();
    tags.extend(owned_tags(cluster_name));
    tags
}

pub fn is_owned(tags: &BTreeMap<String, String>, cluster_name: &str) -> bool {
    tags.get(&owned_tag_key(cluster_name))
        .is_some_and(|value| value == OWNED)
}

/// Ownership check for document resources, which keep tags under `spec.tags`.
pub fn is_owned_document(document: &Value, cluster_name: &str) -> bool {
    document
        .pointer("/spec/tags")
        .and_then(|tags| tags.get(owned_tag_key(cluster_name)))
        .and_then(Value::as_str)
        == Some(OWNED)
}
