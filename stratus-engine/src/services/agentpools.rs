use std::sync::Arc;

use tracing::warn;

use super::document::DocumentSpec;
use crate::audit::AuditLogger;
use crate::cloud::{Creator, Deleter};
use crate::config::ReconcilerConfig;
use crate::mutators::AGENT_POOL_KIND;
use crate::scope::ClusterScope;
use crate::service::Service;

pub const SERVICE_NAME: &str = "agentpools";
pub const READY_CONDITION: &str = "AgentPoolsReady";

/// One spec per agent pool document, in declaration order.
pub fn specs(scope: &ClusterScope, config: &ReconcilerConfig) -> Vec<DocumentSpec> {
    scope
        .resources_of_kind(AGENT_POOL_KIND)
        .filter_map(|document| {
            let spec = DocumentSpec::from_document(
                document,
                scope.resource_group(),
                scope.cluster_name(),
                scope.additional_tags(),
                config.not_terminal_requeue,
            );
            if spec.is_none() {
                warn!(cluster = scope.cluster_name(), "Skipping agent pool document without a name");
            }
            spec
        })
        .collect()
}

/// Agent pool service over `client`.
pub fn service<C>(client: C, config: ReconcilerConfig, audit: Arc<AuditLogger>) -> Service<ClusterScope, DocumentSpec, C>
where
    C: Creator<DocumentSpec> + Deleter<DocumentSpec>,
{
    let spec_config = config.clone();
    Service::new(SERVICE_NAME, READY_CONDITION, client, config, audit, move |scope: &ClusterScope| {
        specs(scope, &spec_config)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Cluster, ManagedControlPlane, ObjectMeta};
    use crate::cloud::memory::InMemoryCloud;
    use crate::cloud::ResourceSpec;
    use crate::conditions::{ConditionSetter, ConditionStatus, REASON_OPERATION_IN_PROGRESS};
    use crate::service::ServiceReconciler;
    use serde_json::{json, Value};

    fn scope() -> ClusterScope {
        let cluster = Cluster {
            metadata: ObjectMeta {
                name: "demo".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut control_plane = ManagedControlPlane::default();
        control_plane.spec.resource_group = "demo-rg".to_string();
        control_plane.spec.resources = vec![
            json!({"kind": "ManagedCluster", "metadata": {"name": "demo-aks"}, "spec": {}}),
            json!({"kind": "ManagedClustersAgentPool", "metadata": {"name": "pool0"}, "spec": {"count": 1, "owner": {"name": "demo-aks"}}}),
            json!({"kind": "ManagedClustersAgentPool", "metadata": {"name": "pool1"}, "spec": {"count": 2, "owner": {"name": "demo-aks"}}}),
        ];
        ClusterScope::new(cluster, control_plane)
    }

    #[test]
    fn test_specs_follow_documents() {
        let specs = specs(&scope(), &ReconcilerConfig::default());
        let names: Vec<_> = specs.iter().map(|s| s.resource_name()).collect();
        assert_eq!(names, ["pool0", "pool1"]);
        assert_eq!(specs[0].owner_resource_name(), Some("demo-aks"));
        assert_eq!(specs[0].resource_group_name(), "demo-rg");
    }

    #[tokio::test]
    async fn test_pools_are_created_then_settle() {
        let service = service(
            InMemoryCloud::<Value>::new(1),
            ReconcilerConfig::default(),
            Arc::new(AuditLogger::new_noop()),
        );
        let mut scope = scope();

        let err = service.reconcile(&mut scope).await.unwrap_err();
        assert!(err.is_in_progress());
        let condition = scope.get_condition(READY_CONDITION).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, REASON_OPERATION_IN_PROGRESS);
        assert_eq!(scope.futures().len(), 2);

        service.reconcile(&mut scope).await.unwrap();
        assert!(scope.futures().is_empty());
        assert!(scope.get_condition(READY_CONDITION).unwrap().is_true());
        let pool = service.client().resource("demo-rg", "pool1").unwrap();
        assert_eq!(pool["spec"]["count"], 2);
        assert_eq!(pool["status"]["provisioningState"], "Succeeded");
    }
}
