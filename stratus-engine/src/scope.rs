use std::collections::BTreeMap;

use serde_json::Value;
use tokio::time::Instant;

use crate::api::{Cluster, ManagedControlPlane};
use crate::conditions::{Condition, ConditionSetter};
use crate::future::{Future, FutureKind, FutureStore};

/// Everything one reconcile of a control plane works on.
///
/// Services read desired state from here and write futures and conditions
/// back into the control plane's status, which the caller persists.
#[derive(Debug, Clone)]
pub struct ClusterScope {
    pub cluster: Cluster,
    pub control_plane: ManagedControlPlane,
    mutated_resources: Option<Vec<Value>>,
    deadline: Option<Instant>,
}

impl ClusterScope {
    pub fn new(cluster: Cluster, control_plane: ManagedControlPlane) -> Self {
        Self {
            cluster,
            control_plane,
            mutated_resources: None,
            deadline: None,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster.metadata.name
    }

    pub fn resource_group(&self) -> &str {
        &self.control_plane.spec.resource_group
    }

    pub fn location(&self) -> &str {
        &self.control_plane.spec.location
    }

    pub fn additional_tags(&self) -> &BTreeMap<String, String> {
        &self.control_plane.spec.additional_tags
    }

    pub fn is_paused(&self) -> bool {
        self.cluster.spec.paused
    }

    /// User resource documents, after mutation when the pipeline has run.
    pub fn resources(&self) -> &[Value] {
        self.mutated_resources
            .as_deref()
            .unwrap_or(&self.control_plane.spec.resources)
    }

    pub fn set_mutated_resources(&mut self, resources: Vec<Value>) {
        self.mutated_resources = Some(resources);
    }

    /// Documents of `kind`, in declaration order.
    pub fn resources_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.resources()
            .iter()
            .filter(move |doc| doc.get("kind").and_then(Value::as_str) == Some(kind))
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.control_plane.status.ready = ready;
    }

    /// Bound the service currently running; `None` lifts the bound.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn futures(&self) -> &[Future] {
        &self.control_plane.status.long_running_operation_states
    }

    pub fn into_parts(self) -> (Cluster, ManagedControlPlane) {
        (self.cluster, self.control_plane)
    }
}

impl FutureStore for ClusterScope {
    fn futures_for(&self, name: &str, service_name: &str) -> Vec<&Future> {
        self.control_plane
            .status
            .long_running_operation_states
            .futures_for(name, service_name)
    }

    fn set_future(&mut self, future: Future) {
        self.control_plane
            .status
            .long_running_operation_states
            .set_future(future);
    }

    fn delete_future(&mut self, name: &str, service_name: &str, kind: &FutureKind) {
        self.control_plane
            .status
            .long_running_operation_states
            .delete_future(name, service_name, kind);
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl ConditionSetter for ClusterScope {
    fn conditions(&self) -> &[Condition] {
        &self.control_plane.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.control_plane.status.conditions
    }
}
