use serde_json::{json, Value};

use super::{ensure_field, indices_of_kind, MutationContext, MutationError, MANAGED_CLUSTER_KIND};

/// Pin the ManagedCluster's version, network ranges and credential secret.
pub fn set_defaults(ctx: &MutationContext<'_>, resources: &mut [Value]) -> Result<(), MutationError> {
    let indices = indices_of_kind(resources, MANAGED_CLUSTER_KIND);
    if indices.is_empty() {
        return Err(MutationError::MissingResource {
            kind: MANAGED_CLUSTER_KIND.to_string(),
        });
    }

    for index in indices {
        set_version(ctx, resources, index)?;
        set_network(ctx, resources, index)?;
        set_credentials_secret(ctx, resources, index)?;
    }
    Ok(())
}

fn set_version(ctx: &MutationContext<'_>, resources: &mut [Value], index: usize) -> Result<(), MutationError> {
    let Some(version) = ctx.kubernetes_version() else {
        return Ok(());
    };
    ensure_field(
        ctx,
        resources,
        index,
        &["kubernetesVersion"],
        Value::String(version.to_string()),
        "Kubernetes version is taken from the control plane",
    )
}

fn set_network(ctx: &MutationContext<'_>, resources: &mut [Value], index: usize) -> Result<(), MutationError> {
    if let Some(cidr) = single_cidr("clusterNetwork.services.cidrBlocks", ctx.cluster.service_cidrs())? {
        ensure_field(
            ctx,
            resources,
            index,
            &["networkProfile", "serviceCidr"],
            Value::String(cidr.to_string()),
            "service CIDR is taken from the cluster network",
        )?;
    }
    if let Some(cidr) = single_cidr("clusterNetwork.pods.cidrBlocks", ctx.cluster.pod_cidrs())? {
        ensure_field(
            ctx,
            resources,
            index,
            &["networkProfile", "podCidr"],
            Value::String(cidr.to_string()),
            "pod CIDR is taken from the cluster network",
        )?;
    }
    Ok(())
}

fn single_cidr<'a>(field: &str, cidrs: &'a [String]) -> Result<Option<&'a str>, MutationError> {
    match cidrs {
        [] => Ok(None),
        [cidr] => Ok(Some(cidr.as_str())),
        _ => Err(MutationError::TooManyCidrs {
            field: field.to_string(),
            count: cidrs.len(),
        }),
    }
}

fn set_credentials_secret(
    ctx: &MutationContext<'_>,
    resources: &mut [Value],
    index: usize,
) -> Result<(), MutationError> {
    ensure_field(
        ctx,
        resources,
        index,
        &["operatorSpec", "secrets", "adminCredentials"],
        json!({
            "name": format!("{}-kubeconfig", ctx.cluster_name()),
            "key": "value",
        }),
        "admin credentials are published as the cluster kubeconfig secret",
    )
}
