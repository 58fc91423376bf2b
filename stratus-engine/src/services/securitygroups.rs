//! Network security groups.
//!
//! Security groups are often shared with other tooling, so the engine merges
//! its rules into whatever the group already has instead of replacing the
//! rule set, and only deletes groups tagged as owned by the cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{SecurityGroupInput, SecurityRuleAccess, SecurityRuleDirection, SecurityRuleInput};
use crate::audit::AuditLogger;
use crate::cloud::{Creator, Deleter, ProvisioningState, ResourceSpec};
use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::scope::ClusterScope;
use crate::service::{ensure_terminal_state, Service};
use crate::tags::{build_tags, is_owned};

pub const SERVICE_NAME: &str = "securitygroups";
pub const READY_CONDITION: &str = "SecurityGroupsReady";

const KIND: &str = "SecurityGroup";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub name: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<ProvisioningState>,
    #[serde(default)]
    pub security_rules: Vec<SecurityRule>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: u16,
    pub direction: SecurityRuleDirection,
    pub protocol: String,
    pub source_address_prefix: String,
    pub source_port_range: String,
    pub destination_address_prefix: String,
    pub destination_port_range: String,
    pub access: SecurityRuleAccess,
}

impl From<&SecurityRuleInput> for SecurityRule {
    fn from(input: &SecurityRuleInput) -> Self {
        Self {
            name: input.name.clone(),
            description: input.description.clone(),
            priority: input.priority,
            direction: input.direction,
            protocol: input.protocol.clone(),
            source_address_prefix: input.source.clone(),
            source_port_range: input.source_ports.clone(),
            destination_address_prefix: input.destination.clone(),
            destination_port_range: input.destination_ports.clone(),
            access: input.access,
        }
    }
}

impl SecurityRule {
    /// Equal up to case of the protocol and an empty description.
    fn matches(&self, other: &SecurityRule) -> bool {
        let description = |rule: &SecurityRule| rule.description.clone().filter(|d| !d.is_empty());
        self.name == other.name
            && self.priority == other.priority
            && self.direction == other.direction
            && self.protocol.eq_ignore_ascii_case(&other.protocol)
            && self.source_address_prefix == other.source_address_prefix
            && self.source_port_range == other.source_port_range
            && self.destination_address_prefix == other.destination_address_prefix
            && self.destination_port_range == other.destination_port_range
            && self.access == other.access
            && description(self) == description(other)
    }
}

fn sort_by_priority(rules: &mut [SecurityRule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

#[derive(Debug, Clone)]
pub struct SecurityGroupSpec {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub rules: Vec<SecurityRule>,
    pub tags: BTreeMap<String, String>,
    pub not_terminal_requeue: Duration,
}

impl SecurityGroupSpec {
    pub fn from_input(scope: &ClusterScope, input: &SecurityGroupInput, not_terminal_requeue: Duration) -> Self {
        let mut rules: Vec<SecurityRule> = input.rules.iter().map(SecurityRule::from).collect();
        sort_by_priority(&mut rules);
        Self {
            name: input.name.clone(),
            resource_group: scope.resource_group().to_string(),
            location: scope.location().to_string(),
            rules,
            tags: build_tags(scope.cluster_name(), scope.additional_tags()),
            not_terminal_requeue,
        }
    }
}

impl ResourceSpec for SecurityGroupSpec {
    type Resource = SecurityGroup;

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_group_name(&self) -> &str {
        &self.resource_group
    }

    fn parameters(&self, existing: Option<&SecurityGroup>) -> Result<Option<SecurityGroup>, ReconcileError> {
        let Some(existing) = existing else {
            return Ok(Some(SecurityGroup {
                name: self.name.clone(),
                location: self.location.clone(),
                security_rules: self.rules.clone(),
                tags: self.tags.clone(),
                ..Default::default()
            }));
        };

        ensure_terminal_state(
            KIND,
            &self.name,
            existing.provisioning_state.as_ref(),
            self.not_terminal_requeue,
        )?;

        let mut rules = existing.security_rules.clone();
        let mut changed = false;
        for rule in &self.rules {
            match rules.iter_mut().find(|existing| existing.name == rule.name) {
                Some(current) if current.matches(rule) => {}
                Some(current) => {
                    debug!(group = %self.name, rule = %rule.name, "Security rule changed");
                    *current = rule.clone();
                    changed = true;
                }
                None => {
                    debug!(group = %self.name, rule = %rule.name, "Security rule missing");
                    rules.push(rule.clone());
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(None);
        }

        sort_by_priority(&mut rules);
        let mut updated = existing.clone();
        updated.security_rules = rules;
        Ok(Some(updated))
    }
}

/// Security group service over `client`.
pub fn service<C>(
    client: C,
    config: ReconcilerConfig,
    audit: Arc<AuditLogger>,
) -> Service<ClusterScope, SecurityGroupSpec, C>
where
    C: Creator<SecurityGroupSpec> + Deleter<SecurityGroupSpec>,
{
    let requeue = config.not_terminal_requeue;
    Service::new(SERVICE_NAME, READY_CONDITION, client, config, audit, move |scope: &ClusterScope| {
        scope
            .control_plane
            .spec
            .security_groups
            .iter()
            .map(|input| SecurityGroupSpec::from_input(scope, input, requeue))
            .collect()
    })
    .with_ownership(|scope: &ClusterScope, group: &SecurityGroup| is_owned(&group.tags, scope.cluster_name()))
}
