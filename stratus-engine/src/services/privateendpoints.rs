//! Private endpoints of the control plane.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::{PrivateEndpointInput, PrivateLinkServiceConnectionInput};
use crate::audit::AuditLogger;
use crate::cloud::{Creator, Deleter, ProvisioningState, ResourceSpec};
use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::scope::ClusterScope;
use crate::service::{ensure_terminal_state, Service};
use crate::tags::build_tags;

pub const SERVICE_NAME: &str = "privateendpoints";
pub const READY_CONDITION: &str = "PrivateEndpointsReady";

const KIND: &str = "PrivateEndpoint";

/// Private endpoint as the network API returns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub name: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<ProvisioningState>,
    pub subnet_id: String,
    #[serde(default)]
    pub application_security_groups: Vec<String>,
    #[serde(default)]
    pub private_link_service_connections: Vec<PrivateLinkServiceConnection>,
    #[serde(default)]
    pub manual_private_link_service_connections: Vec<PrivateLinkServiceConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_network_interface_name: Option<String>,
    #[serde(default)]
    pub ip_configurations: Vec<IpConfiguration>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateLinkServiceConnection {
    pub name: String,
    pub private_link_service_id: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_message: Option<String>,
    /// Approval state, set by the service owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfiguration {
    pub name: String,
    pub private_ip_address: String,
}

impl PrivateEndpoint {
    /// The fields the engine manages, in canonical order.
    ///
    /// Computed fields are cleared, unordered lists sorted and empty strings
    /// treated as unset. IP configurations only count when `with_ip_configs`
    /// is set, since the API allocates them when the user asks for none.
    fn comparable(&self, with_ip_configs: bool) -> PrivateEndpoint {
        fn canonical(connections: &[PrivateLinkServiceConnection]) -> Vec<PrivateLinkServiceConnection> {
            let mut connections: Vec<_> = connections
                .iter()
                .map(|connection| {
                    let mut group_ids = connection.group_ids.clone();
                    group_ids.sort();
                    PrivateLinkServiceConnection {
                        name: connection.name.clone(),
                        private_link_service_id: connection.private_link_service_id.to_lowercase(),
                        group_ids,
                        request_message: non_empty(&connection.request_message),
                        status: None,
                    }
                })
                .collect();
            connections.sort_by(|a, b| a.name.cmp(&b.name));
            connections
        }

        let mut application_security_groups: Vec<String> = self
            .application_security_groups
            .iter()
            .map(|id| id.to_lowercase())
            .collect();
        application_security_groups.sort();

        let mut ip_configurations = if with_ip_configs {
            self.ip_configurations.clone()
        } else {
            Vec::new()
        };
        ip_configurations.sort_by(|a, b| a.name.cmp(&b.name));

        PrivateEndpoint {
            id: None,
            etag: None,
            name: self.name.clone(),
            location: self.location.to_lowercase(),
            provisioning_state: None,
            subnet_id: self.subnet_id.to_lowercase(),
            application_security_groups,
            private_link_service_connections: canonical(&self.private_link_service_connections),
            manual_private_link_service_connections: canonical(&self.manual_private_link_service_connections),
            custom_network_interface_name: non_empty(&self.custom_network_interface_name),
            ip_configurations,
            tags: self.tags.clone(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

#[derive(Debug, Clone)]
pub struct PrivateEndpointSpec {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub subnet_id: String,
    pub application_security_groups: Vec<String>,
    pub connections: Vec<PrivateLinkServiceConnectionInput>,
    pub manual_approval: bool,
    pub custom_network_interface_name: Option<String>,
    pub private_ip_addresses: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub not_terminal_requeue: Duration,
}

impl PrivateEndpointSpec {
    pub fn from_input(scope: &ClusterScope, input: &PrivateEndpointInput, not_terminal_requeue: Duration) -> Self {
        Self {
            name: input.name.clone(),
            resource_group: scope.resource_group().to_string(),
            location: input
                .location
                .clone()
                .unwrap_or_else(|| scope.location().to_string()),
            subnet_id: input.subnet_id.clone(),
            application_security_groups: input.application_security_groups.clone(),
            connections: input.private_link_service_connections.clone(),
            manual_approval: input.manual_approval,
            custom_network_interface_name: input.custom_network_interface_name.clone(),
            private_ip_addresses: input.private_ip_addresses.clone(),
            tags: build_tags(scope.cluster_name(), scope.additional_tags()),
            not_terminal_requeue,
        }
    }

    fn desired(&self) -> PrivateEndpoint {
        let connections: Vec<PrivateLinkServiceConnection> = self
            .connections
            .iter()
            .map(|connection| PrivateLinkServiceConnection {
                name: connection.name.clone(),
                private_link_service_id: connection.private_link_service_id.clone(),
                group_ids: connection.group_ids.clone(),
                request_message: connection.request_message.clone(),
                status: None,
            })
            .collect();
        let (automatic, manual) = if self.manual_approval {
            (Vec::new(), connections)
        } else {
            (connections, Vec::new())
        };

        PrivateEndpoint {
            name: self.name.clone(),
            location: self.location.clone(),
            subnet_id: self.subnet_id.clone(),
            application_security_groups: self.application_security_groups.clone(),
            private_link_service_connections: automatic,
            manual_private_link_service_connections: manual,
            custom_network_interface_name: self.custom_network_interface_name.clone(),
            ip_configurations: self
                .private_ip_addresses
                .iter()
                .enumerate()
                .map(|(i, address)| IpConfiguration {
                    name: format!("{}-ipconfig-{i}", self.name),
                    private_ip_address: address.clone(),
                })
                .collect(),
            tags: self.tags.clone(),
            ..Default::default()
        }
    }
}

impl ResourceSpec for PrivateEndpointSpec {
    type Resource = PrivateEndpoint;

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_group_name(&self) -> &str {
        &self.resource_group
    }

    fn parameters(&self, existing: Option<&PrivateEndpoint>) -> Result<Option<PrivateEndpoint>, ReconcileError> {
        let desired = self.desired();
        let Some(existing) = existing else {
            return Ok(Some(desired));
        };

        ensure_terminal_state(
            KIND,
            &self.name,
            existing.provisioning_state.as_ref(),
            self.not_terminal_requeue,
        )?;

        let with_ip_configs = !self.private_ip_addresses.is_empty();
        if desired.comparable(with_ip_configs) == existing.comparable(with_ip_configs) {
            return Ok(None);
        }
        Ok(Some(desired))
    }
}

/// Private endpoint service over `client`.
pub fn service<C>(
    client: C,
    config: ReconcilerConfig,
    audit: Arc<AuditLogger>,
) -> Service<ClusterScope, PrivateEndpointSpec, C>
where
    C: Creator<PrivateEndpointSpec> + Deleter<PrivateEndpointSpec>,
{
    let requeue = config.not_terminal_requeue;
    Service::new(SERVICE_NAME, READY_CONDITION, client, config, audit, move |scope: &ClusterScope| {
        scope
            .control_plane
            .spec
            .private_endpoints
            .iter()
            .map(|input| PrivateEndpointSpec::from_input(scope, input, requeue))
            .collect()
    })
}
