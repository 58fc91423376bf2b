//! Readiness conditions surfaced on the owning object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

/// Aggregate readiness of the whole object.
pub const READY: &str = "Ready";

pub const REASON_OPERATION_IN_PROGRESS: &str = "OperationInProgress";
pub const REASON_FAILED: &str = "Failed";
pub const REASON_DELETING: &str = "Deleting";
pub const REASON_DELETION_FAILED: &str = "DeletionFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn true_condition(condition_type: &str) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::True,
            severity: None,
            last_transition_time: Utc::now(),
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn false_condition(
        condition_type: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn unknown_condition(condition_type: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::Unknown,
            severity: None,
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Insert or replace `condition` by type.
///
/// The transition time only moves when the status changes.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn get<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Objects that carry a condition list.
pub trait ConditionSetter {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn set_condition(&mut self, condition: Condition) {
        set(self.conditions_mut(), condition);
    }

    fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        get(self.conditions(), condition_type)
    }

    /// Reflect the outcome of a create-or-update pass.
    fn update_put_status(
        &mut self,
        condition_type: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    ) {
        let condition = match err {
            None => Condition::true_condition(condition_type),
            Some(err) if err.is_transient() => Condition::false_condition(
                condition_type,
                REASON_OPERATION_IN_PROGRESS,
                ConditionSeverity::Info,
                format!("{service_name} create or update is in progress"),
            ),
            Some(err) => Condition::false_condition(
                condition_type,
                REASON_FAILED,
                ConditionSeverity::Error,
                format!("{service_name} failed to create or update. err: {err}"),
            ),
        };
        self.set_condition(condition);
    }

    /// Reflect the outcome of a delete pass.
    fn update_delete_status(
        &mut self,
        condition_type: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    ) {
        let condition = match err {
            None => Condition::true_condition(condition_type),
            Some(err) if err.is_transient() => Condition::false_condition(
                condition_type,
                REASON_DELETING,
                ConditionSeverity::Info,
                format!("{service_name} deletion is in progress"),
            ),
            Some(err) => Condition::false_condition(
                condition_type,
                REASON_DELETION_FAILED,
                ConditionSeverity::Error,
                format!("{service_name} failed to delete. err: {err}"),
            ),
        };
        self.set_condition(condition);
    }
}

impl ConditionSetter for Vec<Condition> {
    fn conditions(&self) -> &[Condition] {
        self
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        self
    }
}
