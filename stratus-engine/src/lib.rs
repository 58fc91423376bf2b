//! stratus-engine: asynchronous reconciliation engine for cloud resources.
//!
//! The engine materializes declarative desired state into a cloud provider's
//! REST API. Remote operations are long-running: a submission returns a
//! poller, the poller's resume token is persisted as a [`Future`] in the
//! owning object's status, and the next reconcile resumes it.
//!
//! Building blocks, leaves first:
//! - [`future`]: per-(resource, service, kind) resume token store
//! - [`ratelimit`]: token bucket + `Retry-After` cooldown per service
//! - [`converters`]: poller <-> persisted future translation
//! - [`asyncpoller`]: idempotent create-or-update / delete protocol
//! - [`service`]: generic per-resource-kind service and result folding
//! - [`mutators`]: contract-field injection into user-authored documents

pub mod api;
pub mod asyncpoller;
pub mod audit;
pub mod cloud;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod converters;
pub mod diff;
pub mod error;
pub mod future;
pub mod mirror;
pub mod mutators;
pub mod ratelimit;
pub mod requeue;
pub mod scope;
pub mod service;
pub mod services;
pub mod tags;

// Re-export commonly used types at crate root
pub use api::{Cluster, ManagedControlPlane};
pub use asyncpoller::AsyncReconciler;
pub use audit::AuditLogger;
pub use cloud::{CloudError, Creator, Deleter, Lro, Poller, ProvisioningState, ResourceSpec};
pub use conditions::{Condition, ConditionSetter, ConditionSeverity, ConditionStatus};
pub use config::{ConfigError, EngineConfig, ReconcilerConfig};
pub use controller::ControlPlaneReconciler;
pub use error::ReconcileError;
pub use future::{Future, FutureKind, FutureStore};
pub use requeue::{Action, ItemBackoff};
pub use scope::ClusterScope;
pub use service::{Service, ServiceReconciler};
