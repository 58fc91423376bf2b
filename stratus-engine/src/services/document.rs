//! Resources described by user-authored documents.
//!
//! ManagedCluster and agent pool resources are written by the user as whole
//! documents in `spec.resources`. The engine writes the document (minus its
//! status) and only compares the `spec` it manages against what the cloud has.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::cloud::{ProvisioningState, ResourceSpec};
use crate::diff::{is_subset, normalize, strip_fields};
use crate::error::ReconcileError;
use crate::mutators::{kind_of, name_of};
use crate::service::ensure_terminal_state;
use crate::tags::build_tags;

/// Fields the cloud fills in; never compared.
pub const COMPUTED_FIELDS: &[&str] = &[
    "id",
    "etag",
    "provisioningState",
    "powerState",
    "nodeImageVersion",
    "fqdn",
    "azurePortalFQDN",
];

/// `status.provisioningState` of a document.
pub fn provisioning_state(document: &Value) -> Option<ProvisioningState> {
    document
        .pointer("/status/provisioningState")
        .and_then(Value::as_str)
        .map(ProvisioningState::from)
}

#[derive(Debug, Clone)]
pub struct DocumentSpec {
    kind: String,
    name: String,
    resource_group: String,
    owner: Option<String>,
    body: Value,
    not_terminal_requeue: Duration,
}

impl DocumentSpec {
    /// Build the spec for `document`, tagging it as owned by `cluster_name`.
    ///
    /// Returns `None` for documents without a kind or name.
    pub fn from_document(
        document: &Value,
        resource_group: &str,
        cluster_name: &str,
        additional_tags: &BTreeMap<String, String>,
        not_terminal_requeue: Duration,
    ) -> Option<Self> {
        let kind = kind_of(document)?.to_string();
        let name = name_of(document)?.to_string();
        let owner = document
            .pointer("/spec/owner/name")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut body = document.clone();
        let fields = body.as_object_mut()?;
        fields.remove("status");
        let spec = fields
            .entry("spec")
            .or_insert_with(|| Value::Object(Map::new()));
        if !spec.is_object() {
            *spec = Value::Object(Map::new());
        }
        let mut tags: BTreeMap<String, String> = spec
            .get("tags")
            .and_then(|tags| serde_json::from_value(tags.clone()).ok())
            .unwrap_or_default();
        tags.extend(build_tags(cluster_name, additional_tags));
        spec["tags"] = serde_json::to_value(tags).ok()?;

        Some(Self {
            kind,
            name,
            resource_group: resource_group.to_string(),
            owner,
            body,
            not_terminal_requeue,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The document the engine writes.
    pub fn body(&self) -> &Value {
        &self.body
    }

    fn managed_spec(document: &Value) -> Value {
        let mut spec = document.get("spec").cloned().unwrap_or(Value::Null);
        strip_fields(&mut spec, COMPUTED_FIELDS);
        normalize(&spec)
    }
}

impl ResourceSpec for DocumentSpec {
    type Resource = Value;

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_group_name(&self) -> &str {
        &self.resource_group
    }

    fn owner_resource_name(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    fn parameters(&self, existing: Option<&Value>) -> Result<Option<Value>, ReconcileError> {
        let Some(existing) = existing else {
            return Ok(Some(self.body.clone()));
        };

        ensure_terminal_state(
            &self.kind,
            &self.name,
            provisioning_state(existing).as_ref(),
            self.not_terminal_requeue,
        )?;

        let desired = Self::managed_spec(&self.body);
        let current = Self::managed_spec(existing);
        if is_subset(&desired, &current) {
            return Ok(None);
        }
        Ok(Some(self.body.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REQUEUE: Duration = Duration::from_secs(20);

    fn spec(document: Value) -> DocumentSpec {
        let extra = BTreeMap::from([("env".to_string(), "dev".to_string())]);
        DocumentSpec::from_document(&document, "demo-rg", "demo", &extra, REQUEUE).unwrap()
    }

    fn pool() -> Value {
        json!({
            "kind": "ManagedClustersAgentPool",
            "metadata": {"name": "pool0"},
            "spec": {"count": 3, "vmSize": "Standard_D2s_v3", "owner": {"name": "demo-aks"}},
            "status": {"conditions": []}
        })
    }

    #[test]
    fn test_body_drops_status_and_adds_tags() {
        let spec = spec(pool());
        assert_eq!(spec.resource_name(), "pool0");
        assert_eq!(spec.resource_group_name(), "demo-rg");
        assert_eq!(spec.owner_resource_name(), Some("demo-aks"));
        assert!(spec.body().get("status").is_none());
        assert_eq!(spec.body()["spec"]["tags"]["stratus.io_cluster_demo"], "owned");
        assert_eq!(spec.body()["spec"]["tags"]["env"], "dev");
    }

    #[test]
    fn test_missing_resource_is_created() {
        let spec = spec(pool());
        assert_eq!(spec.parameters(None).unwrap().as_ref(), Some(spec.body()));
    }

    #[test]
    fn test_semantic_diff_ignores_computed_and_empty_fields() {
        let spec = spec(pool());
        let mut existing = spec.body().clone();
        existing["spec"]["nodeImageVersion"] = json!("AKSUbuntu-2204");
        existing["spec"]["count"] = json!(3.0);
        existing["spec"]["nodeLabels"] = json!({});
        existing["status"] = json!({"provisioningState": "Succeeded", "id": "/x"});
        assert!(spec.parameters(Some(&existing)).unwrap().is_none());

        existing["spec"]["count"] = json!(5);
        assert!(spec.parameters(Some(&existing)).unwrap().is_some());
    }

    #[test]
    fn test_update_waits_for_terminal_state() {
        let spec = spec(pool());
        let mut existing = spec.body().clone();
        existing["spec"]["count"] = json!(1);
        existing["status"] = json!({"provisioningState": "Updating"});

        let err = spec.parameters(Some(&existing)).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.requeue_after(), Some(REQUEUE));
    }

    #[test]
    fn test_nameless_documents_are_rejected() {
        let extra = BTreeMap::new();
        let doc = json!({"kind": "ManagedCluster", "spec": {}});
        assert!(DocumentSpec::from_document(&doc, "g", "demo", &extra, REQUEUE).is_none());
    }
}
