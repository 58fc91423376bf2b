//! The managed Kubernetes cluster itself.
//!
//! The cluster is reconciled by an upstream operator once written, so beyond
//! the create-or-update protocol this service mirrors the operator's Ready
//! condition and can ask the operator to pause.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::document::{provisioning_state, DocumentSpec};
use crate::asyncpoller::AsyncReconciler;
use crate::audit::AuditLogger;
use crate::cloud::{CloudError, Creator, Deleter, Pauser, ResourceSpec};
use crate::conditions::ConditionSetter;
use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::mirror::{mirror_ready_condition, readiness, upstream_ready};
use crate::mutators::{MutationError, MANAGED_CLUSTER_KIND};
use crate::ratelimit::retry_after_from_error;
use crate::scope::ClusterScope;
use crate::service::ServiceReconciler;
use crate::tags::is_owned_document;

pub const SERVICE_NAME: &str = "managedclusters";
pub const READY_CONDITION: &str = "ManagedClusterReady";

pub struct ManagedClusterService<C> {
    reconciler: AsyncReconciler<DocumentSpec, C>,
    audit: Arc<AuditLogger>,
}

impl<C> ManagedClusterService<C>
where
    C: Creator<DocumentSpec> + Deleter<DocumentSpec> + Pauser<DocumentSpec>,
{
    pub fn new(client: C, config: ReconcilerConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            reconciler: AsyncReconciler::new(client, config, audit.clone()),
            audit,
        }
    }

    pub fn client(&self) -> &C {
        self.reconciler.client()
    }

    fn config(&self) -> &ReconcilerConfig {
        self.reconciler.config()
    }

    /// Spec for the control plane's ManagedCluster document, if it has one.
    fn spec(&self, scope: &ClusterScope) -> Option<DocumentSpec> {
        scope
            .resources_of_kind(MANAGED_CLUSTER_KIND)
            .find_map(|document| {
                DocumentSpec::from_document(
                    document,
                    scope.resource_group(),
                    scope.cluster_name(),
                    scope.additional_tags(),
                    self.config().not_terminal_requeue,
                )
            })
    }

    fn transient(&self, context: String, err: CloudError) -> ReconcileError {
        let delay = retry_after_from_error(
            &err,
            self.config().requeue_after,
            self.config().http429_retry_after,
        );
        ReconcileError::transient(ReconcileError::Cloud { context, source: err }, delay)
    }

    /// Translate the written resource into a condition and a result.
    fn observe(&self, scope: &mut ClusterScope, spec: &DocumentSpec, resource: Option<&Value>) -> Result<(), ReconcileError> {
        let upstream = resource.and_then(upstream_ready);
        let state = resource.and_then(provisioning_state);

        let result = readiness(
            MANAGED_CLUSTER_KIND,
            spec.resource_name(),
            upstream.as_ref(),
            state.as_ref(),
            self.config().requeue_after,
        );
        match &result {
            Err(err) if !err.is_transient() => {
                scope.update_put_status(READY_CONDITION, SERVICE_NAME, Some(err));
            }
            _ => {
                scope.set_condition(mirror_ready_condition(READY_CONDITION, upstream.as_ref(), state.as_ref()));
            }
        }
        result
    }
}

#[async_trait]
impl<C> ServiceReconciler<ClusterScope> for ManagedClusterService<C>
where
    C: Creator<DocumentSpec> + Deleter<DocumentSpec> + Pauser<DocumentSpec>,
{
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ReconcileError> {
        let Some(spec) = self.spec(scope) else {
            let err = ReconcileError::from(MutationError::MissingResource {
                kind: MANAGED_CLUSTER_KIND.to_string(),
            });
            scope.update_put_status(READY_CONDITION, SERVICE_NAME, Some(&err));
            return Err(err);
        };

        match self.reconciler.create_or_update(scope, &spec, SERVICE_NAME).await {
            Ok(resource) => self.observe(scope, &spec, resource.as_ref()),
            Err(err) => {
                scope.update_put_status(READY_CONDITION, SERVICE_NAME, Some(&err));
                Err(err)
            }
        }
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ReconcileError> {
        let Some(spec) = self.spec(scope) else {
            debug!(cluster = scope.cluster_name(), "No managed cluster to delete");
            return Ok(());
        };

        let result = self.reconciler.delete(scope, &spec, SERVICE_NAME).await;
        scope.update_delete_status(READY_CONDITION, SERVICE_NAME, result.as_ref().err());
        result
    }

    async fn is_managed(&self, scope: &ClusterScope) -> Result<bool, ReconcileError> {
        let Some(spec) = self.spec(scope) else {
            return Ok(true);
        };
        match self.reconciler.get_existing(&spec).await {
            Ok(existing) => Ok(existing.map_or(true, |doc| is_owned_document(&doc, scope.cluster_name()))),
            Err(err) => Err(self.transient(
                format!("failed to check ownership of managed cluster {}", spec.resource_name()),
                err,
            )),
        }
    }

    async fn pause(&self, scope: &mut ClusterScope) -> Result<(), ReconcileError> {
        let Some(spec) = self.spec(scope) else {
            return Ok(());
        };
        let name = spec.resource_name();
        let group = spec.resource_group_name();

        let timeout = self.config().call_timeout;
        let result = match tokio::time::timeout(timeout, self.client().pause(&spec)).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Timeout(timeout)),
        };
        match result {
            Ok(()) => {
                info!(service = SERVICE_NAME, resource = name, group, "Paused managed cluster reconciliation");
                self.audit.resource_paused(SERVICE_NAME, group, name);
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) if err.is_retriable() => Err(self.transient(
                format!("failed to pause managed cluster {group}/{name}"),
                err,
            )),
            Err(err) => Err(ReconcileError::Cloud {
                context: format!("failed to pause managed cluster {group}/{name}"),
                source: err,
            }),
        }
    }
}
