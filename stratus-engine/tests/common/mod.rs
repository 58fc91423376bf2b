//! Shared test utilities for stratus-engine integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use stratus_engine::api::Manifest;
use stratus_engine::audit::{AuditLogger, MemoryRecorder};
use stratus_engine::cloud::{CloudError, Creator, Deleter, Lro, Poller, ResourceSpec};
use stratus_engine::diff::is_subset;
use stratus_engine::{AsyncReconciler, ReconcileError, ReconcilerConfig};

pub const SERVICE: &str = "svcA";

/// A control plane with one managed cluster, two agent pools, a security
/// group and a private endpoint.
pub const MANIFEST: &str = r#"
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
    additionalTags:
      env: test
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
          mode: System
          count: 1
      - kind: ManagedClustersAgentPool
        metadata:
          name: user
        spec:
          mode: User
          count: 3
    securityGroups:
      - name: demo-nsg
        rules:
          - name: allow-https
            priority: 100
            destinationPorts: "443"
    privateEndpoints:
      - name: demo-pe
        subnetId: /subscriptions/s/resourceGroups/demo-rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/pe
        privateLinkServiceConnections:
          - name: vault
            privateLinkServiceId: /subscriptions/s/resourceGroups/demo-rg/providers/Microsoft.KeyVault/vaults/demo
            groupIds: ["vault"]
"#;

pub fn manifest() -> Manifest {
    Manifest::from_yaml(MANIFEST).unwrap()
}

/// Audit logger that keeps its events for assertions.
pub fn memory_audit() -> (Arc<MemoryRecorder>, Arc<AuditLogger>) {
    let recorder = Arc::new(MemoryRecorder::new());
    let audit = Arc::new(AuditLogger::new(recorder.clone()));
    (recorder, audit)
}

/// Spec whose desired body must be contained in the existing resource.
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub name: String,
    pub group: String,
    pub body: Value,
    pub parameters_error: Option<String>,
}

impl TestSpec {
    pub fn new(group: &str, name: &str, body: Value) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            body,
            parameters_error: None,
        }
    }
}

impl ResourceSpec for TestSpec {
    type Resource = Value;

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_group_name(&self) -> &str {
        &self.group
    }

    fn parameters(&self, existing: Option<&Value>) -> Result<Option<Value>, ReconcileError> {
        if let Some(message) = &self.parameters_error {
            return Err(ReconcileError::terminal(message.clone()));
        }
        match existing {
            Some(existing) if is_subset(&self.body, existing) => Ok(None),
            _ => Ok(Some(self.body.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestPoller {
    pub token: String,
    pub interval: Option<Duration>,
}

impl TestPoller {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            interval: None,
        }
    }
}

impl Poller for TestPoller {
    fn resume_token(&self) -> Result<String, CloudError> {
        Ok(self.token.clone())
    }

    fn is_done(&self) -> bool {
        false
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.interval
    }
}

/// A recorded client call, with the resume token it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get,
    Put(Option<String>),
    Delete(Option<String>),
}

/// Cloud client that answers from scripted queues.
///
/// Empty queues fall back to: get is not found, writes and deletes finish
/// inline. With a submit latency, writes and deletes take that long; one
/// that outlasts its timeout comes back pending with a `<name>-running`
/// token.
#[derive(Default)]
pub struct ScriptedCloud {
    gets: Mutex<VecDeque<Result<Value, CloudError>>>,
    puts: Mutex<VecDeque<Lro<Value, TestPoller>>>,
    deletes: Mutex<VecDeque<Lro<(), TestPoller>>>,
    calls: Mutex<Vec<Call>>,
    timeouts: Mutex<Vec<Duration>>,
    submit_latency: Mutex<Option<Duration>>,
}

impl ScriptedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_get(&self, result: Result<Value, CloudError>) -> &Self {
        self.gets.lock().unwrap().push_back(result);
        self
    }

    pub fn on_put(&self, lro: Lro<Value, TestPoller>) -> &Self {
        self.puts.lock().unwrap().push_back(lro);
        self
    }

    pub fn on_delete(&self, lro: Lro<(), TestPoller>) -> &Self {
        self.deletes.lock().unwrap().push_back(lro);
        self
    }

    pub fn slow_submits(&self, latency: Duration) -> &Self {
        *self.submit_latency.lock().unwrap() = Some(latency);
        self
    }

    /// Timeouts handed to write and delete submissions, in call order.
    pub fn submit_timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }

    /// Sleep out the submit latency; true when the timeout ran out first.
    async fn submit_delay(&self, timeout: Duration) -> bool {
        self.timeouts.lock().unwrap().push(timeout);
        let latency = *self.submit_latency.lock().unwrap();
        match latency {
            Some(latency) => {
                tokio::time::sleep(latency.min(timeout)).await;
                latency > timeout
            }
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn puts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Put(_)))
            .count()
    }

    pub fn deletes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Delete(_)))
            .count()
    }
}

#[async_trait]
impl Creator<TestSpec> for ScriptedCloud {
    type Poller = TestPoller;

    async fn get(&self, spec: &TestSpec) -> Result<Value, CloudError> {
        self.calls.lock().unwrap().push(Call::Get);
        self.gets
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CloudError::not_found(format!("{} not found", spec.name))))
    }

    async fn create_or_update_async(
        &self,
        spec: &TestSpec,
        resume_token: Option<String>,
        parameters: Value,
        timeout: Duration,
    ) -> Lro<Value, TestPoller> {
        self.calls.lock().unwrap().push(Call::Put(resume_token));
        if self.submit_delay(timeout).await {
            return Lro::Pending {
                poller: TestPoller::new(&format!("{}-running", spec.name)),
                cause: None,
            };
        }
        self.puts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Lro::Done(parameters))
    }
}

#[async_trait]
impl Deleter<TestSpec> for ScriptedCloud {
    type Poller = TestPoller;

    async fn delete_async(
        &self,
        spec: &TestSpec,
        resume_token: Option<String>,
        timeout: Duration,
    ) -> Lro<(), TestPoller> {
        self.calls.lock().unwrap().push(Call::Delete(resume_token));
        if self.submit_delay(timeout).await {
            return Lro::Pending {
                poller: TestPoller::new(&format!("{}-running", spec.name)),
                cause: None,
            };
        }
        self.deletes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Lro::Done(()))
    }
}

pub fn reconciler(cloud: ScriptedCloud) -> AsyncReconciler<TestSpec, ScriptedCloud> {
    AsyncReconciler::new(cloud, ReconcilerConfig::default(), Arc::new(AuditLogger::new_noop()))
}
