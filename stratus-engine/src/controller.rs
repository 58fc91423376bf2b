//! Top-level reconcile of a managed control plane.
//!
//! Runs the mutator pipeline over the user's resource documents, then each
//! service in declaration order. The first failing service stops the pass;
//! the next reconcile picks up where it left off through the stored futures.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::cloud::{Creator, Deleter, Pauser};
use crate::conditions::{Condition, ConditionSetter, ConditionSeverity, READY};
use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::mutators::{apply_mutators, default_mutators, MutationContext, ResourcesMutator};
use crate::scope::ClusterScope;
use crate::service::ServiceReconciler;
use crate::services::agentpools;
use crate::services::document::DocumentSpec;
use crate::services::images::{resolve_image_references, ImageResolver};
use crate::services::managedclusters::ManagedClusterService;
use crate::services::privateendpoints::{self, PrivateEndpointSpec};
use crate::services::securitygroups::{self, SecurityGroupSpec};

pub const RESOURCES_MUTATED: &str = "ResourcesMutated";

const IMAGES: &str = "images";

const REASON_MUTATION_FAILED: &str = "MutationFailed";
const REASON_DELETED: &str = "Deleted";

type BoxedService = Box<dyn ServiceReconciler<ClusterScope>>;

pub struct ControlPlaneReconciler {
    services: Vec<BoxedService>,
    mutators: Vec<Box<dyn ResourcesMutator>>,
    images: Option<Arc<dyn ImageResolver>>,
    config: ReconcilerConfig,
    audit: Arc<AuditLogger>,
}

impl ControlPlaneReconciler {
    pub fn new(services: Vec<BoxedService>, config: ReconcilerConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            services,
            mutators: default_mutators(),
            images: None,
            config,
            audit,
        }
    }

    /// The standard service set: security groups, the managed cluster, its
    /// agent pools, then private endpoints.
    pub fn from_clients<SG, MC, AP, PE>(
        security_groups: SG,
        managed_clusters: MC,
        agent_pools: AP,
        private_endpoints: PE,
        config: ReconcilerConfig,
        audit: Arc<AuditLogger>,
    ) -> Self
    where
        SG: Creator<SecurityGroupSpec> + Deleter<SecurityGroupSpec> + 'static,
        MC: Creator<DocumentSpec> + Deleter<DocumentSpec> + Pauser<DocumentSpec> + 'static,
        AP: Creator<DocumentSpec> + Deleter<DocumentSpec> + 'static,
        PE: Creator<PrivateEndpointSpec> + Deleter<PrivateEndpointSpec> + 'static,
    {
        let services: Vec<BoxedService> = vec![
            Box::new(securitygroups::service(security_groups, config.clone(), audit.clone())),
            Box::new(ManagedClusterService::new(managed_clusters, config.clone(), audit.clone())),
            Box::new(agentpools::service(agent_pools, config.clone(), audit.clone())),
            Box::new(privateendpoints::service(private_endpoints, config.clone(), audit.clone())),
        ];
        Self::new(services, config, audit)
    }

    pub fn with_mutators(mut self, mutators: Vec<Box<dyn ResourcesMutator>>) -> Self {
        self.mutators = mutators;
        self
    }

    /// Pin `spec.imageReference` versions of the mutated documents through
    /// `images` before services run.
    pub fn with_images(mut self, images: Arc<dyn ImageResolver>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|service| service.name()).collect()
    }

    /// Bring the cloud in line with the control plane's spec.
    pub async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ReconcileError> {
        if scope.is_paused() {
            return self.pause(scope).await;
        }

        let mut resources = self.mutate(scope)?;
        self.resolve_images(scope, &mut resources).await?;
        scope.set_mutated_resources(resources);

        for service in &self.services {
            let name = service.name();
            debug!(cluster = scope.cluster_name(), service = name, "Reconciling service");
            scope.set_deadline(Some(self.deadline()));
            let result = service.reconcile(scope).await;
            scope.set_deadline(None);

            if let Err(err) = result {
                let err = err.context(format!("failed to reconcile {name}"));
                scope.update_put_status(READY, name, Some(&err));
                scope.set_ready(false);
                return Err(err);
            }
        }

        info!(cluster = scope.cluster_name(), "Control plane is ready");
        scope.set_condition(Condition::true_condition(READY));
        scope.set_ready(true);
        scope.control_plane.status.version = scope.control_plane.spec.version.clone();
        Ok(())
    }

    /// Remove everything the services created, last service first.
    pub async fn reconcile_delete(&self, scope: &mut ClusterScope) -> Result<(), ReconcileError> {
        scope.set_ready(false);

        for service in self.services.iter().rev() {
            let name = service.name();
            debug!(cluster = scope.cluster_name(), service = name, "Deleting service resources");
            scope.set_deadline(Some(self.deadline()));
            let result = service.delete(scope).await;
            scope.set_deadline(None);

            if let Err(err) = result {
                let err = err.context(format!("failed to delete {name}"));
                scope.update_delete_status(READY, name, Some(&err));
                return Err(err);
            }
        }

        info!(cluster = scope.cluster_name(), "Control plane resources deleted");
        scope.set_condition(Condition::false_condition(
            READY,
            REASON_DELETED,
            ConditionSeverity::Info,
            "all resources deleted",
        ));
        Ok(())
    }

    async fn pause(&self, scope: &mut ClusterScope) -> Result<(), ReconcileError> {
        info!(cluster = scope.cluster_name(), "Cluster is paused, pausing services");
        for service in &self.services {
            service
                .pause(scope)
                .await
                .map_err(|err| err.context(format!("failed to pause {}", service.name())))?;
        }
        Ok(())
    }

    /// Run the mutator pipeline over the user's documents.
    fn mutate(&self, scope: &mut ClusterScope) -> Result<Vec<Value>, ReconcileError> {
        let ctx = MutationContext {
            cluster: &scope.cluster,
            control_plane: &scope.control_plane,
            audit: self.audit.as_ref(),
        };
        match apply_mutators(&ctx, &scope.control_plane.spec.resources, &self.mutators) {
            Ok(resources) => {
                scope.set_condition(Condition::true_condition(RESOURCES_MUTATED));
                Ok(resources)
            }
            Err(err) => {
                warn!(cluster = scope.cluster_name(), error = %err, "Resource mutation failed");
                let message = err.to_string();
                scope.set_condition(Condition::false_condition(
                    RESOURCES_MUTATED,
                    REASON_MUTATION_FAILED,
                    ConditionSeverity::Error,
                    message.clone(),
                ));
                scope.set_condition(Condition::false_condition(
                    READY,
                    REASON_MUTATION_FAILED,
                    ConditionSeverity::Error,
                    message,
                ));
                scope.set_ready(false);
                Err(err.into())
            }
        }
    }

    async fn resolve_images(&self, scope: &mut ClusterScope, resources: &mut [Value]) -> Result<(), ReconcileError> {
        let Some(images) = &self.images else {
            return Ok(());
        };
        let location = scope.location().to_string();
        match resolve_image_references(images.as_ref(), &location, resources).await {
            Ok(pinned) => {
                debug!(cluster = scope.cluster_name(), pinned, "Resolved image references");
                Ok(())
            }
            Err(err) => {
                warn!(cluster = scope.cluster_name(), error = %err, "Image resolution failed");
                let err = if err.is_retriable() {
                    ReconcileError::transient(err, self.config.requeue_after)
                } else {
                    ReconcileError::from(err)
                };
                let err = err.context("failed to resolve image references");
                scope.update_put_status(READY, IMAGES, Some(&err));
                scope.set_ready(false);
                Err(err)
            }
        }
    }

    /// Deadline for the service about to run. Services run to completion;
    /// their cloud calls are shortened to end by this instant.
    fn deadline(&self) -> Instant {
        Instant::now() + self.config.service_reconcile_timeout
    }
}
