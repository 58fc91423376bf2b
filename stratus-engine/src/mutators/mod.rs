//! Contract-field injection into user-authored resource documents.
//!
//! The engine owns a few fields of the documents in `spec.resources` (the
//! Kubernetes version, network ranges, credential references). Mutators fill
//! those fields in when the user left them unset and reject documents that
//! set them to something else. The first incompatibility aborts the pipeline.

pub mod agentpool;
pub mod managedcluster;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::api::{Cluster, ManagedControlPlane};
use crate::audit::AuditLogger;
use crate::diff::render;

pub const MANAGED_CLUSTER_KIND: &str = "ManagedCluster";
pub const AGENT_POOL_KIND: &str = "ManagedClustersAgentPool";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("incompatible value at {location}: engine requires {engine_value:?}, resource sets {user_value:?} ({reason})")]
    Incompatible {
        location: String,
        engine_value: String,
        user_value: String,
        reason: String,
    },

    #[error("no {kind} resource defined in spec.resources")]
    MissingResource { kind: String },

    #[error("invalid resource at {location}: {message}")]
    InvalidDocument { location: String, message: String },

    #[error("{field} allows a single CIDR block, found {count}")]
    TooManyCidrs { field: String, count: usize },
}

/// Inputs a mutator may read.
pub struct MutationContext<'a> {
    pub cluster: &'a Cluster,
    pub control_plane: &'a ManagedControlPlane,
    pub audit: &'a AuditLogger,
}

impl MutationContext<'_> {
    pub fn cluster_name(&self) -> &str {
        &self.cluster.metadata.name
    }

    /// Control plane version without a leading `v`.
    pub fn kubernetes_version(&self) -> Option<&str> {
        self.control_plane
            .spec
            .version
            .as_deref()
            .map(|version| version.strip_prefix('v').unwrap_or(version))
            .filter(|version| !version.is_empty())
    }
}

/// One step of the pipeline.
pub trait ResourcesMutator: Send + Sync {
    fn mutate(&self, ctx: &MutationContext<'_>, resources: &mut [Value]) -> Result<(), MutationError>;
}

impl<F> ResourcesMutator for F
where
    F: Fn(&MutationContext<'_>, &mut [Value]) -> Result<(), MutationError> + Send + Sync,
{
    fn mutate(&self, ctx: &MutationContext<'_>, resources: &mut [Value]) -> Result<(), MutationError> {
        self(ctx, resources)
    }
}

/// Mutators applied to every control plane, in order.
pub fn default_mutators() -> Vec<Box<dyn ResourcesMutator>> {
    vec![
        Box::new(validate_documents),
        Box::new(managedcluster::set_defaults),
        Box::new(agentpool::set_defaults),
    ]
}

/// Every resource must be an object with a `kind` and a `metadata.name`.
pub fn validate_documents(_ctx: &MutationContext<'_>, resources: &mut [Value]) -> Result<(), MutationError> {
    for (index, document) in resources.iter().enumerate() {
        let location = format!("spec.resources[{index}]");
        if !document.is_object() {
            return Err(MutationError::InvalidDocument {
                location,
                message: "resource is not an object".to_string(),
            });
        }
        if kind_of(document).map_or(true, str::is_empty) {
            return Err(MutationError::InvalidDocument {
                location,
                message: "resource has no kind".to_string(),
            });
        }
        if name_of(document).map_or(true, str::is_empty) {
            return Err(MutationError::InvalidDocument {
                location,
                message: "resource has no metadata.name".to_string(),
            });
        }
    }
    Ok(())
}

/// Run `mutators` over a copy of `resources`.
///
/// The input is left untouched, so a failed pipeline applies nothing.
pub fn apply_mutators(
    ctx: &MutationContext<'_>,
    resources: &[Value],
    mutators: &[Box<dyn ResourcesMutator>],
) -> Result<Vec<Value>, MutationError> {
    let mut mutated = resources.to_vec();
    for mutator in mutators {
        mutator.mutate(ctx, &mut mutated)?;
    }
    Ok(mutated)
}

/// Kind of a resource document.
pub fn kind_of(document: &Value) -> Option<&str> {
    document.get("kind").and_then(Value::as_str)
}

/// `metadata.name` of a resource document.
pub fn name_of(document: &Value) -> Option<&str> {
    document.pointer("/metadata/name").and_then(Value::as_str)
}

/// Indices of the documents of `kind`.
pub fn indices_of_kind(resources: &[Value], kind: &str) -> Vec<usize> {
    resources
        .iter()
        .enumerate()
        .filter(|(_, doc)| kind_of(doc) == Some(kind))
        .map(|(i, _)| i)
        .collect()
}

/// Make `spec.<path>` of `resources[index]` equal `value`.
///
/// Unset fields are set and logged; fields already equal are left alone; any
/// other value is an incompatibility.
pub fn ensure_field(
    ctx: &MutationContext<'_>,
    resources: &mut [Value],
    index: usize,
    path: &[&str],
    value: Value,
    reason: &str,
) -> Result<(), MutationError> {
    let location = format!("spec.resources[{index}].spec.{}", path.join("."));
    let Some((leaf, parents)) = path.split_last() else {
        return Err(MutationError::InvalidDocument {
            location,
            message: "empty field path".to_string(),
        });
    };

    let Some(document) = resources.get_mut(index) else {
        return Err(MutationError::InvalidDocument {
            location,
            message: "no such resource".to_string(),
        });
    };

    let mut node = object_child(document, "spec", &location)?;
    for parent in parents {
        node = object_child(node, parent, &location)?;
    }
    let Value::Object(fields) = node else {
        return Err(not_an_object(&location));
    };

    match fields.get(*leaf) {
        Some(existing) if !existing.is_null() => {
            if *existing == value {
                return Ok(());
            }
            Err(MutationError::Incompatible {
                location,
                engine_value: render(&value),
                user_value: render(existing),
                reason: reason.to_string(),
            })
        }
        _ => {
            let rendered = render(&value);
            info!(location = %location, value = %rendered, reason, "Setting resource field");
            ctx.audit.mutation_applied(&location, &rendered, reason);
            fields.insert((*leaf).to_string(), value);
            Ok(())
        }
    }
}

/// Child object `key` of `node`, created when absent.
fn object_child<'a>(node: &'a mut Value, key: &str, location: &str) -> Result<&'a mut Value, MutationError> {
    let Value::Object(fields) = node else {
        return Err(not_an_object(location));
    };
    let child = fields
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if child.is_null() {
        *child = Value::Object(Map::new());
    }
    if !child.is_object() {
        return Err(not_an_object(location));
    }
    Ok(child)
}

fn not_an_object(location: &str) -> MutationError {
    MutationError::InvalidDocument {
        location: location.to_string(),
        message: "parent of field is not an object".to_string(),
    }
}
