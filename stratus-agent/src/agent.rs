//! Simulation loop: drives the engine against in-memory clouds the way a
//! controller runtime would, one tick per reconcile.
//!
//! Between ticks the control plane only exists as its serialized document,
//! so every tick resumes long-running operations from persisted status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use stratus_engine::api::Manifest;
use stratus_engine::cloud::limited::RateLimitedClient;
use stratus_engine::cloud::memory::{InMemoryCloud, InMemoryImageCatalog};
use stratus_engine::ratelimit::RateLimiters;
use stratus_engine::requeue::action_for;
use stratus_engine::services::privateendpoints::{self, PrivateEndpoint};
use stratus_engine::services::securitygroups::{self, SecurityGroup};
use stratus_engine::services::{agentpools, managedclusters, ImageCache, ImageKey};
use stratus_engine::{
    Action, AuditLogger, ClusterScope, ControlPlaneReconciler, EngineConfig, ItemBackoff,
};

/// Knobs of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Upper bound on reconcile ticks per phase.
    pub ticks: u32,
    /// Polls before a simulated operation finishes.
    pub latency_polls: u32,
    /// Factor applied to requeue delays before sleeping; zero never sleeps.
    pub time_scale: f64,
    /// Tear everything down once the control plane is ready.
    pub delete: bool,
    /// Where the control plane document is written after every tick.
    pub status_path: Option<PathBuf>,
    /// Images published in the simulated marketplace.
    pub images: Vec<CatalogEntry>,
}

/// One image of a simulated marketplace catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub location: String,
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub versions: Vec<String>,
}

impl CatalogEntry {
    /// Parse a YAML list of catalog entries.
    pub fn from_yaml(yaml: &str) -> Result<Vec<Self>> {
        serde_yaml::from_str(yaml).context("Invalid image catalog")
    }

    fn key(&self) -> ImageKey {
        ImageKey::new(&self.location, &self.publisher, &self.offer, &self.sku)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reconcile,
    Delete,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Reconcile => "reconcile",
            Phase::Delete => "delete",
        }
    }
}

/// Simulated clouds, one per service, behind the configured rate limiters.
struct Clouds {
    security_groups: Arc<InMemoryCloud<SecurityGroup>>,
    managed_clusters: Arc<InMemoryCloud<Value>>,
    agent_pools: Arc<InMemoryCloud<Value>>,
    private_endpoints: Arc<InMemoryCloud<PrivateEndpoint>>,
    images: Arc<InMemoryImageCatalog>,
}

impl Clouds {
    fn new(latency_polls: u32, catalog: &[CatalogEntry]) -> Self {
        let images = Arc::new(InMemoryImageCatalog::new());
        for entry in catalog {
            images.publish(entry.key(), entry.versions.iter().cloned());
        }
        Self {
            images,
            security_groups: Arc::new(InMemoryCloud::new(latency_polls)),
            managed_clusters: Arc::new(InMemoryCloud::new(latency_polls)),
            agent_pools: Arc::new(InMemoryCloud::new(latency_polls)),
            private_endpoints: Arc::new(InMemoryCloud::new(latency_polls)),
        }
    }

    fn resource_count(&self) -> usize {
        self.security_groups.len()
            + self.managed_clusters.len()
            + self.agent_pools.len()
            + self.private_endpoints.len()
    }

    fn controller(&self, config: &EngineConfig, audit: Arc<AuditLogger>) -> Result<ControlPlaneReconciler> {
        let limiters = RateLimiters::new(&config.rate_limits).context("Invalid rate limit configuration")?;
        let fallback = config.reconciler.http429_retry_after;

        Ok(ControlPlaneReconciler::from_clients(
            RateLimitedClient::new(
                self.security_groups.clone(),
                limiters.for_service(securitygroups::SERVICE_NAME),
                fallback,
            ),
            RateLimitedClient::new(
                self.managed_clusters.clone(),
                limiters.for_service(managedclusters::SERVICE_NAME),
                fallback,
            ),
            RateLimitedClient::new(
                self.agent_pools.clone(),
                limiters.for_service(agentpools::SERVICE_NAME),
                fallback,
            ),
            RateLimitedClient::new(
                self.private_endpoints.clone(),
                limiters.for_service(privateendpoints::SERVICE_NAME),
                fallback,
            ),
            config.reconciler.clone(),
            audit,
        )
        .with_images(Arc::new(ImageCache::with_capacity(
            self.images.clone(),
            config.image_cache_capacity,
        ))))
    }
}

/// Runs one control plane to readiness (and optionally back to nothing).
pub struct Simulation {
    options: SimulationOptions,
    clouds: Clouds,
    controller: ControlPlaneReconciler,
    backoff: ItemBackoff,
    document: String,
}

impl Simulation {
    pub fn new(manifest: &Manifest, config: &EngineConfig, options: SimulationOptions) -> Result<Self> {
        let clouds = Clouds::new(options.latency_polls, &options.images);
        let controller = clouds.controller(config, Arc::new(AuditLogger::tracing()))?;
        let document = manifest.to_yaml().context("Failed to serialize manifest")?;

        Ok(Self {
            options,
            clouds,
            controller,
            backoff: ItemBackoff::default(),
            document,
        })
    }

    /// The control plane document as last persisted.
    pub fn document(&self) -> &str {
        &self.document
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            services = ?self.controller.service_names(),
            latency_polls = self.options.latency_polls,
            "Starting simulation"
        );

        let ticks = self.run_phase(Phase::Reconcile).await?;
        info!(ticks, resources = self.clouds.resource_count(), "Control plane is ready");

        if self.options.delete {
            let ticks = self.run_phase(Phase::Delete).await?;
            info!(ticks, resources = self.clouds.resource_count(), "Control plane deleted");
        }
        Ok(())
    }

    /// Tick until the phase reports done; returns the number of ticks used.
    async fn run_phase(&mut self, phase: Phase) -> Result<u32> {
        for tick in 1..=self.options.ticks {
            let manifest = Manifest::from_yaml(&self.document).context("Failed to load persisted status")?;
            let mut scope = ClusterScope::new(manifest.cluster, manifest.control_plane);
            let key = scope.cluster_name().to_string();

            let result = match phase {
                Phase::Reconcile => self.controller.reconcile(&mut scope).await,
                Phase::Delete => self.controller.reconcile_delete(&mut scope).await,
            };
            let action = action_for(&result);

            self.persist(scope).await?;

            let delay = match (action, &result) {
                (Action::Done, _) => {
                    self.backoff.forget(&key);
                    debug!(phase = phase.as_str(), tick, "Tick finished");
                    return Ok(tick);
                }
                (Action::RequeueAfter(delay), Err(err)) => {
                    info!(phase = phase.as_str(), tick, requeue_after = ?delay, reason = %err, "Requeueing");
                    delay
                }
                (Action::RequeueAfter(delay), Ok(())) => delay,
                (Action::RequeueWithBackoff, result) => {
                    let delay = self.backoff.next_delay(&key);
                    if let Err(err) = result {
                        warn!(phase = phase.as_str(), tick, backoff = ?delay, error = %err, "Reconcile failed");
                    }
                    delay
                }
            };
            self.sleep(delay).await;
        }

        bail!(
            "{} did not finish within {} ticks",
            phase.as_str(),
            self.options.ticks
        )
    }

    async fn persist(&mut self, scope: ClusterScope) -> Result<()> {
        let (cluster, control_plane) = scope.into_parts();
        self.document = Manifest {
            cluster,
            control_plane,
        }
        .to_yaml()
        .context("Failed to serialize status")?;

        if let Some(path) = &self.options.status_path {
            tokio::fs::write(path, &self.document)
                .await
                .with_context(|| format!("Failed to write status to {}", path.display()))?;
        }
        Ok(())
    }

    async fn sleep(&self, delay: Duration) {
        if !(self.options.time_scale.is_finite() && self.options.time_scale > 0.0) {
            return;
        }
        tokio::time::sleep(delay.mul_f64(self.options.time_scale)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
cluster:
  metadata:
    name: demo
  spec:
    clusterNetwork:
      pods:
        cidrBlocks: ["10.244.0.0/16"]
      services:
        cidrBlocks: ["10.96.0.0/12"]
controlPlane:
  metadata:
    name: demo-cp
  spec:
    version: v1.30.0
    resourceGroup: demo-rg
    location: westeurope
    resources:
      - kind: ManagedCluster
        metadata:
          name: demo-aks
        spec:
          dnsPrefix: demo
      - kind: ManagedClustersAgentPool
        metadata:
          name: system
        spec:
          count: 1
    securityGroups:
      - name: demo-nsg
"#;

    fn options(delete: bool) -> SimulationOptions {
        SimulationOptions {
            ticks: 30,
            latency_polls: 2,
            time_scale: 0.0,
            delete,
            status_path: None,
            images: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_simulation_reaches_ready() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let mut simulation = Simulation::new(&manifest, &EngineConfig::default(), options(false)).unwrap();

        simulation.run().await.unwrap();

        let status = Manifest::from_yaml(simulation.document()).unwrap().control_plane.status;
        assert!(status.ready);
        assert!(status.long_running_operation_states.is_empty());
        assert_eq!(simulation.clouds.resource_count(), 3);
    }

    #[tokio::test]
    async fn test_simulation_deletes_everything() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let mut simulation = Simulation::new(&manifest, &EngineConfig::default(), options(true)).unwrap();

        simulation.run().await.unwrap();

        assert_eq!(simulation.clouds.resource_count(), 0);
        let status = Manifest::from_yaml(simulation.document()).unwrap().control_plane.status;
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_simulation_pins_latest_image() {
        let mut manifest = Manifest::from_yaml(MANIFEST).unwrap();
        manifest.control_plane.spec.resources[1]["spec"]["imageReference"] = serde_json::json!({
            "publisher": "Canonical",
            "offer": "ubuntu-24_04-lts",
            "sku": "server",
            "version": "latest",
        });
        let images = CatalogEntry::from_yaml(
            r#"
- location: westeurope
  publisher: Canonical
  offer: ubuntu-24_04-lts
  sku: server
  versions: ["24.04.202402", "24.04.202410"]
"#,
        )
        .unwrap();
        let mut simulation = Simulation::new(
            &manifest,
            &EngineConfig::default(),
            SimulationOptions {
                images,
                ..options(false)
            },
        )
        .unwrap();

        simulation.run().await.unwrap();

        let pool = simulation.clouds.agent_pools.resource("demo-rg", "system").unwrap();
        assert_eq!(pool["spec"]["imageReference"]["version"], "24.04.202410");
        assert_eq!(simulation.clouds.images.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_manifest_exhausts_ticks() {
        let mut manifest = Manifest::from_yaml(MANIFEST).unwrap();
        manifest.control_plane.spec.resources[0]["spec"] = serde_json::json!({"kubernetesVersion": "1.29.0"});
        let mut simulation = Simulation::new(
            &manifest,
            &EngineConfig::default(),
            SimulationOptions {
                ticks: 3,
                ..options(false)
            },
        )
        .unwrap();

        let err = simulation.run().await.unwrap_err();
        assert!(err.to_string().contains("within 3 ticks"), "{err}");
        assert_eq!(simulation.clouds.resource_count(), 0);
    }
}
