//! In-memory cloud used by the simulator and tests.
//!
//! Writes and deletes complete after a configurable number of polls, so the
//! full persist-and-resume cycle runs without a real API. Faults can be
//! queued per operation class to exercise throttling and error paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::{
    CloudError, Creator, Deleter, Lro, OperationClass, Pauser, Poller, ProvisioningState,
    ResourceSpec,
};
use crate::diff;
use crate::error::ReconcileError;
use crate::services::document;
use crate::services::images::{ImageKey, ImageLister};
use crate::services::privateendpoints::PrivateEndpoint;
use crate::services::securitygroups::SecurityGroup;

/// A resource the simulator can store.
pub trait SimResource: Clone + fmt::Debug + Send + Sync + 'static {
    fn provisioning_state(&self) -> Option<ProvisioningState>;

    fn set_provisioning_state(&mut self, state: ProvisioningState);

    /// Fill in server-computed fields after a write lands.
    fn settle(&mut self, _id: &str) {}
}

/// Document resources keep their state under `status`.
///
/// The simulated operator mirrors the provisioning state into a `Ready`
/// condition the way an upstream operator would.
impl SimResource for Value {
    fn provisioning_state(&self) -> Option<ProvisioningState> {
        document::provisioning_state(self)
    }

    fn set_provisioning_state(&mut self, state: ProvisioningState) {
        let ready = match &state {
            ProvisioningState::Succeeded => json!({"type": "Ready", "status": "True"}),
            ProvisioningState::Failed => json!({
                "type": "Ready",
                "status": "False",
                "severity": "Error",
                "reason": "Failed",
                "message": "resource provisioning failed",
            }),
            other => json!({
                "type": "Ready",
                "status": "False",
                "severity": "Info",
                "reason": "Reconciling",
                "message": format!("provisioning state is {other}"),
            }),
        };

        if !self.is_object() {
            *self = json!({});
        }
        if let Some(object) = self.as_object_mut() {
            let status = object.entry("status").or_insert_with(|| json!({}));
            if !status.is_object() {
                *status = json!({});
            }
            status["provisioningState"] = Value::String(state.to_string());
            status["conditions"] = json!([ready]);
        }
    }

    fn settle(&mut self, id: &str) {
        if let Some(status) = self.get_mut("status") {
            status["id"] = Value::String(id.to_string());
        }
    }
}

impl SimResource for SecurityGroup {
    fn provisioning_state(&self) -> Option<ProvisioningState> {
        self.provisioning_state.clone()
    }

    fn set_provisioning_state(&mut self, state: ProvisioningState) {
        self.provisioning_state = Some(state);
    }

    fn settle(&mut self, id: &str) {
        self.id = Some(id.to_string());
        self.etag = Some(format!("W/\"{}\"", Uuid::new_v4()));
    }
}

/// Connections to services that approve automatically come back approved;
/// manual ones wait for the service owner.
impl SimResource for PrivateEndpoint {
    fn provisioning_state(&self) -> Option<ProvisioningState> {
        self.provisioning_state.clone()
    }

    fn set_provisioning_state(&mut self, state: ProvisioningState) {
        self.provisioning_state = Some(state);
    }

    fn settle(&mut self, id: &str) {
        self.id = Some(id.to_string());
        self.etag = Some(format!("W/\"{}\"", Uuid::new_v4()));
        for connection in &mut self.private_link_service_connections {
            connection.status = Some("Approved".to_string());
        }
        for connection in &mut self.manual_private_link_service_connections {
            connection.status = Some("Pending".to_string());
        }
    }
}

/// Poller handed out by [`InMemoryCloud`].
#[derive(Debug, Clone)]
pub struct SimPoller {
    token: String,
    done: bool,
    interval: Option<Duration>,
}

impl Poller for SimPoller {
    fn resume_token(&self) -> Result<String, CloudError> {
        Ok(self.token.clone())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.interval
    }
}

/// Number of calls the simulator has served, faults included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: usize,
    pub puts: usize,
    pub deletes: usize,
    pub pauses: usize,
}

type Key = (String, String);

enum Pending<R> {
    Put(R),
    Delete,
}

struct Operation<R> {
    key: Key,
    pending: Pending<R>,
    polls_remaining: u32,
}

enum Started<R> {
    Done(Option<R>),
    Pending(String),
}

struct CloudState<R> {
    resources: HashMap<Key, R>,
    operations: HashMap<String, Operation<R>>,
    completed: HashMap<String, (Key, Option<R>)>,
    faults: HashMap<OperationClass, VecDeque<CloudError>>,
    paused: HashSet<Key>,
    calls: CallCounts,
}

impl<R> Default for CloudState<R> {
    fn default() -> Self {
        Self {
            resources: HashMap::new(),
            operations: HashMap::new(),
            completed: HashMap::new(),
            faults: HashMap::new(),
            paused: HashSet::new(),
            calls: CallCounts::default(),
        }
    }
}

impl<R> CloudState<R> {
    fn take_fault(&mut self, class: OperationClass) -> Option<CloudError> {
        self.faults.get_mut(&class).and_then(VecDeque::pop_front)
    }
}

/// Simulated cloud for one resource kind.
pub struct InMemoryCloud<R> {
    latency_polls: u32,
    poll_interval: Option<Duration>,
    state: Mutex<CloudState<R>>,
}

impl<R: SimResource> InMemoryCloud<R> {
    /// Operations finish after `latency_polls` resumes or reads of the
    /// resource; zero finishes them inline.
    pub fn new(latency_polls: u32) -> Self {
        Self {
            latency_polls,
            poll_interval: None,
            state: Mutex::new(CloudState::default()),
        }
    }

    /// Polling hint returned with every poller.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    fn lock(&self) -> MutexGuard<'_, CloudState<R>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an error for the next call of `class`.
    pub fn inject_fault(&self, class: OperationClass, err: CloudError) {
        self.lock().faults.entry(class).or_default().push_back(err);
    }

    pub fn insert(&self, group: &str, name: &str, resource: R) {
        self.lock()
            .resources
            .insert((group.to_string(), name.to_string()), resource);
    }

    pub fn resource(&self, group: &str, name: &str) -> Option<R> {
        self.lock()
            .resources
            .get(&(group.to_string(), name.to_string()))
            .cloned()
    }

    /// Change a stored resource out of band.
    pub fn update<F: FnOnce(&mut R)>(&self, group: &str, name: &str, f: F) -> bool {
        match self
            .lock()
            .resources
            .get_mut(&(group.to_string(), name.to_string()))
        {
            Some(resource) => {
                f(resource);
                true
            }
            None => false,
        }
    }

    pub fn set_provisioning_state(&self, group: &str, name: &str, state: ProvisioningState) -> bool {
        self.update(group, name, |resource| resource.set_provisioning_state(state))
    }

    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    pub fn operations_in_flight(&self) -> usize {
        self.lock().operations.len()
    }

    pub fn is_paused(&self, group: &str, name: &str) -> bool {
        self.lock()
            .paused
            .contains(&(group.to_string(), name.to_string()))
    }

    fn poller(&self, token: String) -> SimPoller {
        SimPoller {
            token,
            done: false,
            interval: self.poll_interval,
        }
    }

    /// Apply a finished operation to the resource map.
    fn complete(state: &mut CloudState<R>, operation: Operation<R>) -> Option<R> {
        let (group, name) = &operation.key;
        match operation.pending {
            Pending::Put(mut resource) => {
                resource.set_provisioning_state(ProvisioningState::Succeeded);
                resource.settle(&format!("/resourceGroups/{group}/resources/{name}"));
                state.resources.insert(operation.key.clone(), resource.clone());
                Some(resource)
            }
            Pending::Delete => {
                state.resources.remove(&operation.key);
                None
            }
        }
    }

    /// Advance a stored operation by one poll.
    ///
    /// `Ok(None)` while it is still running; `Ok(Some(result))` once it has
    /// finished. Tokens of finished operations stay resumable once.
    fn resume(
        &self,
        state: &mut CloudState<R>,
        token: &str,
        key: &Key,
    ) -> Result<Option<Option<R>>, CloudError> {
        if let Some((finished_key, result)) = state.completed.remove(token) {
            if &finished_key != key {
                return Err(CloudError::InvalidResumeToken(format!(
                    "token {token} belongs to another resource"
                )));
            }
            return Ok(Some(result));
        }

        let Some(operation) = state.operations.get_mut(token) else {
            return Err(CloudError::InvalidResumeToken(format!(
                "no operation for token {token}"
            )));
        };
        if &operation.key != key {
            return Err(CloudError::InvalidResumeToken(format!(
                "token {token} belongs to another resource"
            )));
        }

        operation.polls_remaining = operation.polls_remaining.saturating_sub(1);
        if operation.polls_remaining > 0 {
            debug!(token, remaining = operation.polls_remaining, "Operation still running");
            return Ok(None);
        }

        match state.operations.remove(token) {
            Some(operation) => Ok(Some(Self::complete(state, operation))),
            None => Ok(None),
        }
    }

    /// Server-side progress: every read moves operations on `key` one step.
    fn advance(state: &mut CloudState<R>, key: &Key) {
        let finished: Vec<String> = state
            .operations
            .iter_mut()
            .filter(|(_, operation)| &operation.key == key)
            .filter_map(|(token, operation)| {
                operation.polls_remaining = operation.polls_remaining.saturating_sub(1);
                (operation.polls_remaining == 0).then(|| token.clone())
            })
            .collect();

        for token in finished {
            if let Some(operation) = state.operations.remove(&token) {
                let key = operation.key.clone();
                let result = Self::complete(state, operation);
                state.completed.insert(token, (key, result));
            }
        }
    }

    fn start(&self, state: &mut CloudState<R>, key: Key, pending: Pending<R>) -> Started<R> {
        if self.latency_polls == 0 {
            let operation = Operation {
                key,
                pending,
                polls_remaining: 0,
            };
            return Started::Done(Self::complete(state, operation));
        }

        let in_flight = match &pending {
            Pending::Put(_) => state.resources.contains_key(&key).then_some(ProvisioningState::Updating),
            Pending::Delete => Some(ProvisioningState::Deleting),
        };
        if let Some(in_flight) = in_flight {
            if let Some(resource) = state.resources.get_mut(&key) {
                resource.set_provisioning_state(in_flight);
            }
        }

        let token = Uuid::new_v4().to_string();
        state.operations.insert(
            token.clone(),
            Operation {
                key,
                pending,
                polls_remaining: self.latency_polls,
            },
        );
        Started::Pending(token)
    }
}

fn key_of<S: ResourceSpec>(spec: &S) -> Key {
    (
        spec.resource_group_name().to_string(),
        spec.resource_name().to_string(),
    )
}

#[async_trait]
impl<S, R> Creator<S> for InMemoryCloud<R>
where
    S: ResourceSpec<Resource = R>,
    R: SimResource,
{
    type Poller = SimPoller;

    async fn get(&self, spec: &S) -> Result<R, CloudError> {
        let mut state = self.lock();
        state.calls.gets += 1;
        if let Some(err) = state.take_fault(OperationClass::Read) {
            return Err(err);
        }
        let key = key_of(spec);
        Self::advance(&mut state, &key);
        state
            .resources
            .get(&key)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("resource {} not found", spec.resource_name())))
    }

    async fn create_or_update_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        parameters: R,
        _timeout: Duration,
    ) -> Lro<R, SimPoller> {
        let mut state = self.lock();
        state.calls.puts += 1;
        if let Some(err) = state.take_fault(OperationClass::Write) {
            return Lro::Failed(err);
        }
        let key = key_of(spec);

        if let Some(token) = resume_token {
            return match self.resume(&mut state, &token, &key) {
                Ok(Some(Some(resource))) => Lro::Done(resource),
                Ok(Some(None)) => Lro::Failed(CloudError::not_found("resource was deleted")),
                Ok(None) => Lro::Pending {
                    poller: self.poller(token),
                    cause: None,
                },
                Err(err) => Lro::Failed(err),
            };
        }

        match self.start(&mut state, key, Pending::Put(parameters)) {
            Started::Done(Some(resource)) => Lro::Done(resource),
            Started::Done(None) => {
                Lro::Failed(CloudError::Transport("write produced no resource".to_string()))
            }
            Started::Pending(token) => Lro::Pending {
                poller: self.poller(token),
                cause: None,
            },
        }
    }
}

#[async_trait]
impl<S, R> Deleter<S> for InMemoryCloud<R>
where
    S: ResourceSpec<Resource = R>,
    R: SimResource,
{
    type Poller = SimPoller;

    async fn delete_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        _timeout: Duration,
    ) -> Lro<(), SimPoller> {
        let mut state = self.lock();
        state.calls.deletes += 1;
        if let Some(err) = state.take_fault(OperationClass::Delete) {
            return Lro::Failed(err);
        }
        let key = key_of(spec);

        if let Some(token) = resume_token {
            return match self.resume(&mut state, &token, &key) {
                Ok(Some(_)) => Lro::Done(()),
                Ok(None) => Lro::Pending {
                    poller: self.poller(token),
                    cause: None,
                },
                Err(err) => Lro::Failed(err),
            };
        }

        if !state.resources.contains_key(&key) {
            return Lro::Failed(CloudError::not_found(format!(
                "resource {} not found",
                spec.resource_name()
            )));
        }

        match self.start(&mut state, key, Pending::Delete) {
            Started::Done(_) => Lro::Done(()),
            Started::Pending(token) => Lro::Pending {
                poller: self.poller(token),
                cause: None,
            },
        }
    }
}

#[async_trait]
impl<S, R> Pauser<S> for InMemoryCloud<R>
where
    S: ResourceSpec<Resource = R>,
    R: SimResource,
{
    async fn pause(&self, spec: &S) -> Result<(), CloudError> {
        let mut state = self.lock();
        state.calls.pauses += 1;
        if let Some(err) = state.take_fault(OperationClass::Write) {
            return Err(err);
        }
        state.paused.insert(key_of(spec));
        Ok(())
    }
}

/// Minimal document spec: writes `desired` unless the existing resource already contains it.
#[derive(Debug, Clone)]
pub struct SimSpec {
    pub group: String,
    pub name: String,
    pub desired: Value,
}

impl SimSpec {
    pub fn new(group: &str, name: &str, desired: Value) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            desired,
        }
    }
}

impl ResourceSpec for SimSpec {
    type Resource = Value;

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_group_name(&self) -> &str {
        &self.group
    }

    fn parameters(&self, existing: Option<&Value>) -> Result<Option<Value>, ReconcileError> {
        match existing {
            Some(existing) if diff::is_subset(&self.desired, existing) => Ok(None),
            _ => Ok(Some(self.desired.clone())),
        }
    }
}

/// Simulated marketplace: the versions published per image.
#[derive(Default)]
pub struct InMemoryImageCatalog {
    images: Mutex<HashMap<ImageKey, Vec<String>>>,
    faults: Mutex<VecDeque<CloudError>>,
    list_calls: Mutex<usize>,
}

impl InMemoryImageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `versions` to the published versions of `key`.
    pub fn publish(&self, key: ImageKey, versions: impl IntoIterator<Item = String>) {
        let mut images = self
            .images
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        images.entry(key).or_default().extend(versions);
    }

    /// Fail the next listing with `err`.
    pub fn fail_next(&self, err: CloudError) {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(err);
    }

    pub fn list_calls(&self) -> usize {
        *self
            .list_calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ImageLister for InMemoryImageCatalog {
    async fn list_versions(&self, key: &ImageKey) -> Result<Vec<String>, CloudError> {
        *self
            .list_calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        if let Some(err) = self
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
        {
            return Err(err);
        }
        let images = self
            .images
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(images.get(key).cloned().unwrap_or_default())
    }
}
