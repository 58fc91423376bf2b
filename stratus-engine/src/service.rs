//! Per-resource-kind services.
//!
//! A service owns the specs of one resource kind, drives each through the
//! [`AsyncReconciler`], folds the outcomes into one result and reports it as
//! a readiness condition on the scope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::asyncpoller::AsyncReconciler;
use crate::audit::AuditLogger;
use crate::cloud::{Creator, Deleter, ProvisioningState, ResourceSpec};
use crate::conditions::ConditionSetter;
use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::future::FutureStore;

/// Uniform contract the control plane reconciler drives.
#[async_trait]
pub trait ServiceReconciler<Sc: Send + Sync + 'static>: Send + Sync {
    /// Service identifier, also used to key futures.
    fn name(&self) -> &str;

    async fn reconcile(&self, scope: &mut Sc) -> Result<(), ReconcileError>;

    async fn delete(&self, scope: &mut Sc) -> Result<(), ReconcileError>;

    /// Whether the service's resources are owned by this cluster.
    async fn is_managed(&self, _scope: &Sc) -> Result<bool, ReconcileError> {
        Ok(true)
    }

    /// Ask upstream operators to stop reconciling. Most services have nothing to pause.
    async fn pause(&self, _scope: &mut Sc) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Scope requirements of a [`Service`].
pub trait ServiceScope: FutureStore + ConditionSetter + Send + Sync {}

impl<T> ServiceScope for T where T: FutureStore + ConditionSetter + Send + Sync {}

/// Keep the most pressing outcome.
///
/// A terminal error shadows a transient one, which shadows an operation in
/// progress. Among equally severe errors the first one wins.
pub fn fold_error(acc: Option<ReconcileError>, err: ReconcileError) -> Option<ReconcileError> {
    match acc {
        Some(current) if current.severity() >= err.severity() => Some(current),
        _ => Some(err),
    }
}

/// Refuse to update a resource whose last operation has not settled.
pub fn ensure_terminal_state(
    kind: &str,
    name: &str,
    state: Option<&ProvisioningState>,
    requeue_after: Duration,
) -> Result<(), ReconcileError> {
    match state {
        Some(state) if !state.is_terminal() => Err(ReconcileError::ResourceNotReady {
            kind: kind.to_string(),
            name: name.to_string(),
            message: format!("provisioning state is {state}, refusing to update until it settles"),
            requeue_after,
        }),
        _ => Ok(()),
    }
}

type SpecsFn<Sc, S> = Box<dyn Fn(&Sc) -> Vec<S> + Send + Sync>;
type OwnershipFn<Sc, R> = Box<dyn Fn(&Sc, &R) -> bool + Send + Sync>;

/// Generic service over one resource kind.
pub struct Service<Sc, S: ResourceSpec, C> {
    name: String,
    ready_condition: String,
    reconciler: AsyncReconciler<S, C>,
    specs: SpecsFn<Sc, S>,
    ownership: Option<OwnershipFn<Sc, S::Resource>>,
}

impl<Sc, S, C> Service<Sc, S, C>
where
    Sc: ServiceScope + 'static,
    S: ResourceSpec,
    C: Creator<S> + Deleter<S>,
{
    pub fn new<F>(
        name: &str,
        ready_condition: &str,
        client: C,
        config: ReconcilerConfig,
        audit: Arc<AuditLogger>,
        specs: F,
    ) -> Self
    where
        F: Fn(&Sc) -> Vec<S> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            ready_condition: ready_condition.to_string(),
            reconciler: AsyncReconciler::new(client, config, audit),
            specs: Box::new(specs),
            ownership: None,
        }
    }

    /// Only delete existing resources for which `owned` holds.
    pub fn with_ownership<F>(mut self, owned: F) -> Self
    where
        F: Fn(&Sc, &S::Resource) -> bool + Send + Sync + 'static,
    {
        self.ownership = Some(Box::new(owned));
        self
    }

    pub fn ready_condition(&self) -> &str {
        &self.ready_condition
    }

    pub fn client(&self) -> &C {
        self.reconciler.client()
    }

    pub fn specs(&self, scope: &Sc) -> Vec<S> {
        (self.specs)(scope)
    }

    /// `Some(false)` when the resource exists and belongs to someone else.
    async fn owned(&self, scope: &Sc, spec: &S) -> Result<Option<bool>, ReconcileError> {
        let Some(owned) = &self.ownership else {
            return Ok(None);
        };
        let existing = self.reconciler.get_existing(spec).await.map_err(|err| {
            let delay = self.reconciler.config().requeue_after;
            ReconcileError::transient(
                ReconcileError::Cloud {
                    context: format!(
                        "failed to check ownership of {}/{}",
                        spec.resource_group_name(),
                        spec.resource_name()
                    ),
                    source: err,
                },
                delay,
            )
        })?;
        Ok(existing.map(|resource| owned(scope, &resource)))
    }

    /// Transient error once the scope's deadline has passed.
    ///
    /// Checked before each spec so a slow service hands back what it has
    /// stored instead of being cut off mid-call.
    fn out_of_time(&self, scope: &Sc, spec: &S) -> Option<ReconcileError> {
        let deadline = scope.deadline()?;
        if Instant::now() < deadline {
            return None;
        }
        warn!(
            service = %self.name,
            resource = spec.resource_name(),
            group = spec.resource_group_name(),
            "Service deadline passed, deferring remaining resources"
        );
        Some(ReconcileError::transient(
            format!(
                "{} ran out of time before {}/{}",
                self.name,
                spec.resource_group_name(),
                spec.resource_name()
            ),
            self.reconciler.config().requeue_after,
        ))
    }
}

#[async_trait]
impl<Sc, S, C> ServiceReconciler<Sc> for Service<Sc, S, C>
where
    Sc: ServiceScope + 'static,
    S: ResourceSpec,
    C: Creator<S> + Deleter<S>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self, scope: &mut Sc) -> Result<(), ReconcileError> {
        let specs = self.specs(scope);
        if specs.is_empty() {
            return Ok(());
        }

        let mut result = None;
        for spec in &specs {
            if let Some(err) = self.out_of_time(scope, spec) {
                result = fold_error(result, err);
                break;
            }
            if let Err(err) = self.reconciler.create_or_update(scope, spec, &self.name).await {
                debug!(service = %self.name, resource = spec.resource_name(), error = %err, "Resource not reconciled");
                result = fold_error(result, err);
            }
        }

        scope.update_put_status(&self.ready_condition, &self.name, result.as_ref());
        match result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete(&self, scope: &mut Sc) -> Result<(), ReconcileError> {
        let specs = self.specs(scope);
        if specs.is_empty() {
            return Ok(());
        }

        let mut result = None;
        for spec in &specs {
            if let Some(err) = self.out_of_time(scope, spec) {
                result = fold_error(result, err);
                break;
            }
            match self.owned(scope, spec).await {
                Ok(Some(false)) => {
                    info!(
                        service = %self.name,
                        resource = spec.resource_name(),
                        group = spec.resource_group_name(),
                        "Skipping delete of unmanaged resource"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    result = fold_error(result, err);
                    continue;
                }
            }
            if let Err(err) = self.reconciler.delete(scope, spec, &self.name).await {
                result = fold_error(result, err);
            }
        }

        scope.update_delete_status(&self.ready_condition, &self.name, result.as_ref());
        match result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn is_managed(&self, scope: &Sc) -> Result<bool, ReconcileError> {
        for spec in self.specs(scope) {
            if self.owned(scope, &spec).await? == Some(false) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::cloud::memory::{InMemoryCloud, SimSpec};
    use crate::cloud::{CloudError, OperationClass};
    use crate::conditions::{Condition, ConditionStatus, REASON_OPERATION_IN_PROGRESS};
    use crate::error::Severity;
    use crate::future::{Future, FutureKind};

    #[derive(Default)]
    struct TestScope {
        futures: Vec<Future>,
        conditions: Vec<Condition>,
        desired: Vec<(String, Value)>,
    }

    impl FutureStore for TestScope {
        fn futures_for(&self, name: &str, service_name: &str) -> Vec<&Future> {
            self.futures.futures_for(name, service_name)
        }

        fn set_future(&mut self, future: Future) {
            self.futures.set_future(future)
        }

        fn delete_future(&mut self, name: &str, service_name: &str, kind: &FutureKind) {
            self.futures.delete_future(name, service_name, kind)
        }
    }

    impl ConditionSetter for TestScope {
        fn conditions(&self) -> &[Condition] {
            &self.conditions
        }

        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }
    }

    fn service(latency_polls: u32) -> Service<TestScope, SimSpec, InMemoryCloud<Value>> {
        Service::new(
            "svcA",
            "SvcAReady",
            InMemoryCloud::new(latency_polls),
            ReconcilerConfig::default(),
            Arc::new(AuditLogger::new_noop()),
            |scope: &TestScope| {
                scope
                    .desired
                    .iter()
                    .map(|(name, doc)| SimSpec::new("g1", name, doc.clone()))
                    .collect()
            },
        )
    }

    fn not_done() -> ReconcileError {
        ReconcileError::OperationNotDone {
            future: Future {
                kind: FutureKind::Put,
                service_name: "svcA".to_string(),
                name: "r".to_string(),
                resource_group: "g".to_string(),
                data: "eA==".to_string(),
            },
            requeue_after: Duration::from_secs(15),
        }
    }

    #[test]
    fn test_fold_precedence() {
        let folded = fold_error(None, not_done());
        assert!(folded.as_ref().unwrap().is_in_progress());

        let folded = fold_error(folded, ReconcileError::terminal("first"));
        let folded = fold_error(folded, not_done());
        let folded = fold_error(folded, ReconcileError::terminal("second"));
        let err = folded.unwrap();
        assert_eq!(err.severity(), Severity::Terminal);
        assert_eq!(err.to_string(), "first");

        let folded = fold_error(Some(not_done()), ReconcileError::transient("429", Duration::from_secs(60)));
        assert_eq!(folded.unwrap().severity(), Severity::Transient);
    }

    #[test]
    fn test_terminal_state_gate() {
        let requeue = Duration::from_secs(20);
        for state in ["Succeeded", "Failed", "Canceled"] {
            assert!(ensure_terminal_state("X", "x", Some(&state.into()), requeue).is_ok());
        }
        assert!(ensure_terminal_state("X", "x", None, requeue).is_ok());

        let err = ensure_terminal_state("X", "x", Some(&"Updating".into()), requeue).unwrap_err();
        assert!(err.is_in_progress());
        assert_eq!(err.requeue_after(), Some(requeue));
    }

    #[tokio::test]
    async fn test_no_specs_is_a_no_op() {
        let service = service(0);
        let mut scope = TestScope::default();
        service.reconcile(&mut scope).await.unwrap();
        assert!(scope.conditions.is_empty());
        assert_eq!(service.client().calls().gets, 0);
    }

    #[tokio::test]
    async fn test_reconcile_sets_condition_from_folded_result() {
        let service = service(1);
        let mut scope = TestScope {
            desired: vec![
                ("r1".to_string(), json!({"spec": {"a": 1}})),
                ("r2".to_string(), json!({"spec": {"b": 2}})),
            ],
            ..Default::default()
        };

        let err = service.reconcile(&mut scope).await.unwrap_err();
        assert!(err.is_operation_not_done());
        assert_eq!(scope.futures.len(), 2);
        let condition = scope.get_condition("SvcAReady").unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, REASON_OPERATION_IN_PROGRESS);

        // Both operations complete on the next pass.
        service.reconcile(&mut scope).await.unwrap();
        assert!(scope.futures.is_empty());
        assert!(scope.get_condition("SvcAReady").unwrap().is_true());

        // Nothing changed: no further writes.
        let puts = service.client().calls().puts;
        service.reconcile(&mut scope).await.unwrap();
        assert_eq!(service.client().calls().puts, puts);
    }

    #[tokio::test]
    async fn test_hard_error_shadows_in_progress() {
        let service = service(1);
        service.client().inject_fault(
            OperationClass::Write,
            CloudError::Transport("connection reset".to_string()),
        );
        let mut scope = TestScope {
            desired: vec![
                ("r1".to_string(), json!({"spec": {"a": 1}})),
                ("r2".to_string(), json!({"spec": {"b": 2}})),
            ],
            ..Default::default()
        };

        let err = service.reconcile(&mut scope).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("connection reset"), "{err}");
        // The second resource still got its operation started.
        assert_eq!(scope.futures.len(), 1);
        assert_eq!(scope.futures[0].name, "r2");
    }

    #[tokio::test]
    async fn test_delete_skips_unowned_resources() {
        let service = service(0).with_ownership(|_scope: &TestScope, resource: &Value| {
            resource.pointer("/spec/owner").and_then(Value::as_str) == Some("me")
        });
        service.client().insert("g1", "mine", json!({"spec": {"owner": "me"}}));
        service.client().insert("g1", "theirs", json!({"spec": {"owner": "them"}}));
        let mut scope = TestScope {
            desired: vec![
                ("mine".to_string(), json!({})),
                ("theirs".to_string(), json!({})),
            ],
            ..Default::default()
        };

        assert!(!service.is_managed(&scope).await.unwrap());
        service.delete(&mut scope).await.unwrap();
        assert!(service.client().resource("g1", "mine").is_none());
        assert!(service.client().resource("g1", "theirs").is_some());
        assert!(scope.get_condition("SvcAReady").unwrap().is_true());
    }
}
