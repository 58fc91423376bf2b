//! Mirroring of an upstream operator's Ready condition.
//!
//! Some resources are reconciled by an operator with its own condition
//! vocabulary. The engine copies the operator's Ready condition onto its own
//! surface, but treats the cloud's provisioning state as authoritative for
//! failure: a `Failed` resource is terminal even while the operator lags,
//! while an operator that is not yet Ready only ever causes a requeue.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::cloud::ProvisioningState;
use crate::conditions::{Condition, ConditionSeverity, ConditionStatus};
use crate::error::ReconcileError;

/// Ready condition as reported by the operator. Everything but the status is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub severity: Option<ConditionSeverity>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// The operator's Ready condition from a resource document's `status.conditions`.
pub fn upstream_ready(document: &Value) -> Option<UpstreamCondition> {
    document
        .pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|c| serde_json::from_value::<UpstreamCondition>(c.clone()).ok())
        .find(|c| c.condition_type == "Ready")
}

/// Translate the operator's Ready condition into `condition_type`.
pub fn mirror_ready_condition(
    condition_type: &str,
    upstream: Option<&UpstreamCondition>,
    state: Option<&ProvisioningState>,
) -> Condition {
    let Some(upstream) = upstream else {
        let state = state.map_or("Unknown", ProvisioningState::as_str);
        return Condition::false_condition(
            condition_type,
            state,
            ConditionSeverity::Info,
            format!("waiting for operator to report readiness, provisioning state is {state}"),
        );
    };

    match upstream.status {
        ConditionStatus::True => Condition::true_condition(condition_type),
        ConditionStatus::False => {
            let severity = match upstream.severity {
                Some(ConditionSeverity::Error) => ConditionSeverity::Error,
                _ => ConditionSeverity::Info,
            };
            Condition::false_condition(
                condition_type,
                &upstream.reason,
                severity,
                upstream.message.clone(),
            )
        }
        ConditionStatus::Unknown => Condition::unknown_condition(
            condition_type,
            &upstream.reason,
            upstream.message.clone(),
        ),
    }
}

/// Reconcile outcome implied by the cloud state and the operator condition.
pub fn readiness(
    kind: &str,
    name: &str,
    upstream: Option<&UpstreamCondition>,
    state: Option<&ProvisioningState>,
    requeue_after: Duration,
) -> Result<(), ReconcileError> {
    if state == Some(&ProvisioningState::Failed) {
        let message = upstream
            .filter(|c| !c.message.is_empty())
            .map_or_else(|| "provisioning state is Failed".to_string(), |c| c.message.clone());
        return Err(ReconcileError::ResourceFailed {
            kind: kind.to_string(),
            name: name.to_string(),
            message,
        });
    }

    match upstream {
        Some(c) if c.status == ConditionStatus::True => Ok(()),
        Some(c) => Err(ReconcileError::ResourceNotReady {
            kind: kind.to_string(),
            name: name.to_string(),
            message: if c.message.is_empty() {
                format!("Ready is {:?}", c.status)
            } else {
                c.message.clone()
            },
            requeue_after,
        }),
        None => Err(ReconcileError::ResourceNotReady {
            kind: kind.to_string(),
            name: name.to_string(),
            message: "operator has not reported readiness yet".to_string(),
            requeue_after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REQUEUE: Duration = Duration::from_secs(15);

    fn upstream(status: ConditionStatus, severity: Option<ConditionSeverity>) -> UpstreamCondition {
        UpstreamCondition {
            condition_type: "Ready".to_string(),
            status,
            severity,
            reason: "Reconciling".to_string(),
            message: "upstream says so".to_string(),
        }
    }

    #[test]
    fn test_mirror_table() {
        let c = mirror_ready_condition("X", Some(&upstream(ConditionStatus::True, None)), None);
        assert!(c.is_true());

        let c = mirror_ready_condition(
            "X",
            Some(&upstream(ConditionStatus::False, Some(ConditionSeverity::Error))),
            None,
        );
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.severity, Some(ConditionSeverity::Error));

        let c = mirror_ready_condition(
            "X",
            Some(&upstream(ConditionStatus::False, Some(ConditionSeverity::Warning))),
            None,
        );
        assert_eq!(c.severity, Some(ConditionSeverity::Info));
        assert_eq!(c.message, "upstream says so");

        let c = mirror_ready_condition("X", Some(&upstream(ConditionStatus::Unknown, None)), None);
        assert_eq!(c.status, ConditionStatus::Unknown);

        let c = mirror_ready_condition("X", None, Some(&ProvisioningState::Creating));
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.severity, Some(ConditionSeverity::Info));
        assert_eq!(c.reason, "Creating");
    }

    #[test]
    fn test_cloud_failure_is_terminal_even_if_operator_lags() {
        let ready = upstream(ConditionStatus::True, None);
        let err = readiness("ManagedCluster", "mc", Some(&ready), Some(&ProvisioningState::Failed), REQUEUE)
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(matches!(err, ReconcileError::ResourceFailed { .. }));
    }

    #[test]
    fn test_operator_lag_requeues() {
        let not_ready = upstream(ConditionStatus::False, Some(ConditionSeverity::Error));
        let err = readiness(
            "ManagedCluster",
            "mc",
            Some(&not_ready),
            Some(&ProvisioningState::Succeeded),
            REQUEUE,
        )
        .unwrap_err();
        assert!(err.is_in_progress());
        assert_eq!(err.requeue_after(), Some(REQUEUE));

        let err = readiness("ManagedCluster", "mc", None, Some(&ProvisioningState::Succeeded), REQUEUE)
            .unwrap_err();
        assert!(err.is_in_progress());

        let ready = upstream(ConditionStatus::True, None);
        assert!(readiness("ManagedCluster", "mc", Some(&ready), Some(&ProvisioningState::Succeeded), REQUEUE).is_ok());
    }

    #[test]
    fn test_upstream_ready_from_document() {
        let doc = json!({
            "status": {
                "conditions": [
                    {"type": "Other", "status": "True"},
                    {"type": "Ready", "status": "False", "severity": "Warning", "message": "scaling"}
                ]
            }
        });
        let ready = upstream_ready(&doc).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.message, "scaling");

        assert!(upstream_ready(&json!({"status": {}})).is_none());
    }
}
