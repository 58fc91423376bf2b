//! Idempotent create-or-update and delete over long-running cloud operations.
//!
//! Nothing here blocks until an operation completes. A submission that is
//! still running after the call timeout is persisted as a [`Future`] in the
//! caller's [`FutureStore`] and reported as [`ReconcileError::OperationNotDone`];
//! the next reconcile resumes it from the stored token.
//!
//! [`Future`]: crate::future::Future

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::cloud::{CloudError, Creator, Deleter, Lro, Poller, ResourceSpec};
use crate::config::ReconcilerConfig;
use crate::converters::{future_to_resume_token, poller_to_future, ConversionError};
use crate::error::ReconcileError;
use crate::future::{FutureKind, FutureStore};
use crate::ratelimit::retry_after_from_error;

/// Log verbs for a create-or-update, chosen by whether the resource exists.
///
/// Returns the progressive form and the past form, e.g. `("creating", "created")`.
pub fn operation_verb(exists: bool) -> (&'static str, &'static str) {
    if exists {
        ("updating", "updated")
    } else {
        ("creating", "created")
    }
}

/// Drives one resource kind through the long-running operation protocol.
pub struct AsyncReconciler<S, C> {
    client: C,
    config: ReconcilerConfig,
    audit: Arc<AuditLogger>,
    _spec: PhantomData<fn() -> S>,
}

impl<S, C> AsyncReconciler<S, C>
where
    S: ResourceSpec,
    C: Creator<S>,
{
    pub fn new(client: C, config: ReconcilerConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            client,
            config,
            audit,
            _spec: PhantomData,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Fetch the existing resource under the call timeout.
    ///
    /// `Ok(None)` when the resource does not exist.
    pub async fn get_existing(&self, spec: &S) -> Result<Option<S::Resource>, CloudError> {
        self.get_within(spec, self.config.call_timeout).await
    }

    async fn get_within(&self, spec: &S, timeout: Duration) -> Result<Option<S::Resource>, CloudError> {
        match self.call(timeout, self.client.get(spec)).await {
            Ok(resource) => Ok(Some(resource)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Create or update the resource described by `spec`.
    ///
    /// Returns the resulting resource, or the existing one when it already
    /// matches. An operation still running after the call timeout is stored as
    /// a PUT future and reported as [`ReconcileError::OperationNotDone`].
    pub async fn create_or_update<St>(
        &self,
        store: &mut St,
        spec: &S,
        service_name: &str,
    ) -> Result<Option<S::Resource>, ReconcileError>
    where
        St: FutureStore + Send + ?Sized,
    {
        let name = spec.resource_name();
        let group = spec.resource_group_name();

        let resume_token = self.resume_token(store, spec, service_name, FutureKind::Put)?;

        let existing = match self.get_within(spec, self.budget(store)).await {
            Ok(existing) => existing,
            Err(err) => {
                let delay = self.requeue_for(&err);
                return Err(ReconcileError::transient(
                    ReconcileError::Cloud {
                        context: format!(
                            "failed to get existing resource {group}/{name} (service: {service_name})"
                        ),
                        source: err,
                    },
                    delay,
                ));
            }
        };

        let parameters = spec.parameters(existing.as_ref()).map_err(|err| {
            err.context(format!(
                "failed to get desired parameters for resource {group}/{name} (service: {service_name})"
            ))
        })?;

        let Some(parameters) = parameters else {
            debug!(service = service_name, resource = name, group, "Resource is up to date");
            store.delete_future(name, service_name, &FutureKind::Put);
            return Ok(existing);
        };

        let (verb, done_verb) = operation_verb(existing.is_some());
        info!(service = service_name, resource = name, group, "{} resource", capitalize(verb));

        let lro = self
            .client
            .create_or_update_async(spec, resume_token, parameters, self.budget(store))
            .await;

        match lro {
            Lro::Done(result) => {
                store.delete_future(name, service_name, &FutureKind::Put);
                info!(service = service_name, resource = name, group, "Successfully {} resource", done_verb);
                if existing.is_some() {
                    self.audit.resource_updated(service_name, group, name);
                } else {
                    self.audit.resource_created(service_name, group, name);
                }
                Ok(Some(result))
            }
            Lro::Pending { poller, cause } => Err(self.operation_pending(
                store,
                &poller,
                cause,
                FutureKind::Put,
                spec,
                service_name,
            )),
            Lro::Failed(err) => Err(self.submit_failed(
                store,
                err,
                FutureKind::Put,
                spec,
                service_name,
                format!("failed to create or update resource {group}/{name} (service: {service_name})"),
            )),
        }
    }

    /// Run a cloud call under `timeout`.
    async fn call<T>(
        &self,
        timeout: Duration,
        request: impl std::future::Future<Output = Result<T, CloudError>>,
    ) -> Result<T, CloudError> {
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Timeout(timeout)),
        }
    }

    /// Time the next call may take: the call timeout, shortened to the
    /// store's deadline.
    ///
    /// Submissions get the same bound, so a client that runs out of time
    /// still hands back its poller and the token is stored.
    fn budget<St>(&self, store: &St) -> Duration
    where
        St: FutureStore + ?Sized,
    {
        match store.deadline() {
            Some(deadline) => self
                .config
                .call_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.config.call_timeout,
        }
    }

    fn requeue_for(&self, err: &CloudError) -> Duration {
        retry_after_from_error(
            err,
            self.config.requeue_after,
            self.config.http429_retry_after,
        )
    }

    /// Decode the stored future for (resource, service, kind), if any.
    ///
    /// Undecodable state, and state of a type this engine never writes, is
    /// discarded so the next reconcile starts fresh.
    fn resume_token<St>(
        &self,
        store: &mut St,
        spec: &S,
        service_name: &str,
        kind: FutureKind,
    ) -> Result<Option<String>, ReconcileError>
    where
        St: FutureStore + ?Sized,
    {
        let name = spec.resource_name();
        let group = spec.resource_group_name();

        let unknown = store
            .futures_for(name, service_name)
            .into_iter()
            .find(|f| matches!(f.kind, FutureKind::Unknown(_)))
            .map(|f| f.kind.clone());
        if let Some(unknown) = unknown {
            warn!(
                service = service_name,
                resource = name,
                group,
                kind = %unknown,
                "Discarding long-running operation state of unknown type"
            );
            store.delete_future(name, service_name, &unknown);
            self.audit.future_reset(
                service_name,
                group,
                name,
                unknown.as_str(),
                &format!("unknown future type {unknown}"),
            );
            return Err(ReconcileError::UnknownFutureKind(unknown.as_str().to_string()));
        }

        let Some(decoded) = store
            .get_future(name, service_name, &kind)
            .map(future_to_resume_token)
        else {
            return Ok(None);
        };

        match decoded {
            Ok(token) => {
                debug!(service = service_name, resource = name, group, kind = %kind, "Resuming long-running operation");
                Ok(Some(token))
            }
            Err(ConversionError::UnknownKind(kind)) => Err(ReconcileError::UnknownFutureKind(kind)),
            Err(source) => {
                warn!(
                    service = service_name,
                    resource = name,
                    group,
                    kind = %kind,
                    error = %source,
                    "Discarding undecodable long-running operation state"
                );
                store.delete_future(name, service_name, &kind);
                self.audit
                    .future_reset(service_name, group, name, kind.as_str(), &source.to_string());
                Err(ReconcileError::FutureReset {
                    service_name: service_name.to_string(),
                    name: name.to_string(),
                    kind,
                    source,
                })
            }
        }
    }

    /// Persist a still-running operation and build the in-progress error.
    fn operation_pending<St, P>(
        &self,
        store: &mut St,
        poller: &P,
        cause: Option<CloudError>,
        kind: FutureKind,
        spec: &S,
        service_name: &str,
    ) -> ReconcileError
    where
        St: FutureStore + ?Sized,
        P: Poller + ?Sized,
    {
        let name = spec.resource_name();
        let group = spec.resource_group_name();

        let future = match poller_to_future(poller, kind.clone(), service_name, name, group) {
            Ok(future) => future,
            Err(source) => {
                return ReconcileError::Poller {
                    context: format!(
                        "failed to store {kind} operation for resource {group}/{name} (service: {service_name})"
                    ),
                    source,
                }
            }
        };
        store.set_future(future.clone());

        let mut requeue_after = self.config.requeue_after;
        if let Some(hint) = poller.poll_interval() {
            requeue_after = requeue_after.max(hint);
        }
        if let Some(cause) = &cause {
            debug!(service = service_name, resource = name, group, error = %cause, "Stopped polling after error");
            requeue_after = requeue_after.max(self.requeue_for(cause));
        }

        info!(
            service = service_name,
            resource = name,
            group,
            kind = %kind,
            requeue_after = ?requeue_after,
            "Operation is not done, stored long-running operation state"
        );
        ReconcileError::OperationNotDone {
            future,
            requeue_after,
        }
    }

    /// Classify a submission rejected without a poller.
    ///
    /// Retriable failures keep any stored future so the same operation is
    /// resumed; anything else drops it and is terminal.
    fn submit_failed<St>(
        &self,
        store: &mut St,
        err: CloudError,
        kind: FutureKind,
        spec: &S,
        service_name: &str,
        context: String,
    ) -> ReconcileError
    where
        St: FutureStore + ?Sized,
    {
        let name = spec.resource_name();
        let group = spec.resource_group_name();

        if err.is_retriable() {
            let requeue_after = self.requeue_for(&err);
            warn!(service = service_name, resource = name, group, error = %err, requeue_after = ?requeue_after, "Retriable cloud error");
            return ReconcileError::transient(
                ReconcileError::Cloud {
                    context,
                    source: err,
                },
                requeue_after,
            );
        }

        warn!(service = service_name, resource = name, group, kind = %kind, error = %err, "Operation failed");
        store.delete_future(name, service_name, &kind);
        ReconcileError::Cloud {
            context,
            source: err,
        }
    }
}

impl<S, C> AsyncReconciler<S, C>
where
    S: ResourceSpec,
    C: Creator<S> + Deleter<S>,
{
    /// Delete the resource described by `spec`.
    ///
    /// A resource that is already gone is a success, and a fresh delete of a
    /// missing resource never submits a delete request.
    pub async fn delete<St>(
        &self,
        store: &mut St,
        spec: &S,
        service_name: &str,
    ) -> Result<(), ReconcileError>
    where
        St: FutureStore + Send + ?Sized,
    {
        let name = spec.resource_name();
        let group = spec.resource_group_name();

        let resume_token = self.resume_token(store, spec, service_name, FutureKind::Delete)?;

        if resume_token.is_none() {
            match self.get_within(spec, self.budget(store)).await {
                Ok(None) => {
                    debug!(service = service_name, resource = name, group, "Resource already deleted");
                    store.delete_future(name, service_name, &FutureKind::Delete);
                    return Ok(());
                }
                Ok(Some(_)) => {}
                Err(err) if err.is_retriable() => {
                    let delay = self.requeue_for(&err);
                    return Err(ReconcileError::transient(
                        ReconcileError::Cloud {
                            context: format!(
                                "failed to get resource {group}/{name} before delete (service: {service_name})"
                            ),
                            source: err,
                        },
                        delay,
                    ));
                }
                // The delete call reports anything that matters.
                Err(err) => {
                    debug!(service = service_name, resource = name, group, error = %err, "Existence check failed, deleting anyway");
                }
            }
        }

        info!(service = service_name, resource = name, group, "Deleting resource");

        let lro = self
            .client
            .delete_async(spec, resume_token, self.budget(store))
            .await;

        match lro {
            Lro::Done(()) => {
                store.delete_future(name, service_name, &FutureKind::Delete);
                info!(service = service_name, resource = name, group, "Successfully deleted resource");
                self.audit.resource_deleted(service_name, group, name);
                Ok(())
            }
            Lro::Pending { poller, cause } => Err(self.operation_pending(
                store,
                &poller,
                cause,
                FutureKind::Delete,
                spec,
                service_name,
            )),
            Lro::Failed(err) if err.is_not_found() => {
                debug!(service = service_name, resource = name, group, "Resource not found during delete");
                store.delete_future(name, service_name, &FutureKind::Delete);
                Ok(())
            }
            Lro::Failed(err) => Err(self.submit_failed(
                store,
                err,
                FutureKind::Delete,
                spec,
                service_name,
                format!("failed to delete resource {group}/{name} (service: {service_name})"),
            )),
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
