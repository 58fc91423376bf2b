use serde_json::Value;

use super::{ensure_field, indices_of_kind, name_of, MutationContext, MutationError, AGENT_POOL_KIND, MANAGED_CLUSTER_KIND};

/// Pin every agent pool's version and owner to the ManagedCluster.
pub fn set_defaults(ctx: &MutationContext<'_>, resources: &mut [Value]) -> Result<(), MutationError> {
    let pools = indices_of_kind(resources, AGENT_POOL_KIND);
    if pools.is_empty() {
        return Ok(());
    }

    let owner = managed_cluster_name(resources)?;
    for index in pools {
        if let Some(version) = ctx.kubernetes_version() {
            ensure_field(
                ctx,
                resources,
                index,
                &["orchestratorVersion"],
                Value::String(version.to_string()),
                "node version is taken from the control plane",
            )?;
        }
        ensure_field(
            ctx,
            resources,
            index,
            &["owner", "name"],
            Value::String(owner.clone()),
            "agent pools belong to the control plane's ManagedCluster",
        )?;
    }
    Ok(())
}

fn managed_cluster_name(resources: &[Value]) -> Result<String, MutationError> {
    let index = indices_of_kind(resources, MANAGED_CLUSTER_KIND)
        .into_iter()
        .next()
        .ok_or_else(|| MutationError::MissingResource {
            kind: MANAGED_CLUSTER_KIND.to_string(),
        })?;
    name_of(&resources[index])
        .map(str::to_string)
        .ok_or_else(|| MutationError::InvalidDocument {
            location: format!("spec.resources[{index}].metadata.name"),
            message: "ManagedCluster has no name".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::mutators::test_support::{cluster, control_plane};
    use serde_json::json;

    #[test]
    fn test_pools_get_version_and_owner() {
        let cluster = cluster("demo", &[], &[]);
        let control_plane = control_plane(Some("v1.30.0"), vec![]);
        let audit = AuditLogger::new_noop();
        let ctx = MutationContext {
            cluster: &cluster,
            control_plane: &control_plane,
            audit: &audit,
        };

        let mut resources = vec![
            json!({"kind": "ManagedCluster", "metadata": {"name": "demo-aks"}, "spec": {}}),
            json!({"kind": "ManagedClustersAgentPool", "metadata": {"name": "pool0"}, "spec": {"count": 3}}),
            json!({"kind": "ManagedClustersAgentPool", "metadata": {"name": "pool1"}}),
        ];
        set_defaults(&ctx, &mut resources).unwrap();

        for pool in &resources[1..] {
            assert_eq!(pool["spec"]["orchestratorVersion"], "1.30.0");
            assert_eq!(pool["spec"]["owner"]["name"], "demo-aks");
        }
        assert_eq!(resources[1]["spec"]["count"], 3);
        assert!(resources[0]["spec"].get("orchestratorVersion").is_none());
    }

    #[test]
    fn test_pool_pinned_to_other_version_is_rejected() {
        let cluster = cluster("demo", &[], &[]);
        let control_plane = control_plane(Some("1.30.0"), vec![]);
        let audit = AuditLogger::new_noop();
        let ctx = MutationContext {
            cluster: &cluster,
            control_plane: &control_plane,
            audit: &audit,
        };
        let mut resources = vec![
            json!({"kind": "ManagedCluster", "metadata": {"name": "demo-aks"}}),
            json!({"kind": "ManagedClustersAgentPool", "spec": {"orchestratorVersion": "1.29.0"}}),
        ];
        let err = set_defaults(&ctx, &mut resources).unwrap_err();
        assert!(matches!(
            err,
            MutationError::Incompatible { ref location, .. } if location == "spec.resources[1].spec.orchestratorVersion"
        ));
    }

    #[test]
    fn test_no_pools_is_a_no_op() {
        let cluster = cluster("demo", &[], &[]);
        let control_plane = control_plane(Some("1.30.0"), vec![]);
        let audit = AuditLogger::new_noop();
        let ctx = MutationContext {
            cluster: &cluster,
            control_plane: &control_plane,
            audit: &audit,
        };
        let mut resources: Vec<Value> = vec![];
        set_defaults(&ctx, &mut resources).unwrap();
    }
}
