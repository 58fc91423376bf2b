//! Cloud SDK seams.
//!
//! The engine never speaks HTTP itself. Concrete clients implement [`Creator`]
//! and [`Deleter`] for a [`ResourceSpec`] and hand back SDK pollers inside
//! [`Lro`] results. The poller is owned by the client; the engine only keeps
//! its resume token.

pub mod limited;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ReconcileError;

/// Class of request, used to pick a rate limiter bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
    Delete,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClass::Read => write!(f, "read"),
            OperationClass::Write => write!(f, "write"),
            OperationClass::Delete => write!(f, "delete"),
        }
    }
}

/// Error response returned by the cloud API.
#[derive(Debug, Clone)]
pub struct ResponseError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub code: String,
    pub message: String,
}

impl ResponseError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Attach a response header. Values that are not valid header text are dropped.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Raw `Retry-After` header value, if the response carried one.
    pub fn retry_after(&self) -> Option<&str> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RESPONSE {}: {}: {}",
            self.status.as_u16(),
            self.code,
            self.message
        )
    }
}

impl std::error::Error for ResponseError {}

const RETRIABLE_STATUSES: [StatusCode; 6] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Errors surfaced by cloud clients.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// The API answered with an error response.
    #[error("{0}")]
    Response(ResponseError),

    /// The client-side limiter refused the request.
    #[error("client-side rate limit exceeded for {service} {class} requests")]
    RateLimited {
        service: String,
        class: OperationClass,
        retry_at: Option<DateTime<Utc>>,
    },

    /// The call did not finish within its per-call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The poller has not reached a state that can be resumed (e.g. a synchronous 204).
    #[error("poller is not resumable: {0}")]
    NotResumable(String),

    /// A persisted resume token was rejected by the SDK.
    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CloudError {
    pub fn not_found(message: impl Into<String>) -> Self {
        CloudError::Response(ResponseError::new(
            StatusCode::NOT_FOUND,
            "ResourceNotFound",
            message,
        ))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CloudError::Response(response) => Some(response.status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            CloudError::Response(response) => {
                response.retry_after().is_some() || RETRIABLE_STATUSES.contains(&response.status)
            }
            CloudError::RateLimited { .. } | CloudError::Timeout(_) => true,
            CloudError::NotResumable(_)
            | CloudError::InvalidResumeToken(_)
            | CloudError::Transport(_) => false,
        }
    }
}

/// Provisioning state reported by the cloud for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProvisioningState {
    Succeeded,
    Failed,
    Canceled,
    Creating,
    Updating,
    Deleting,
    InProgress,
    Other(String),
}

impl ProvisioningState {
    /// Succeeded, Failed and Canceled are terminal; anything else is still moving.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Succeeded | ProvisioningState::Failed | ProvisioningState::Canceled
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProvisioningState::Succeeded => "Succeeded",
            ProvisioningState::Failed => "Failed",
            ProvisioningState::Canceled => "Canceled",
            ProvisioningState::Creating => "Creating",
            ProvisioningState::Updating => "Updating",
            ProvisioningState::Deleting => "Deleting",
            ProvisioningState::InProgress => "InProgress",
            ProvisioningState::Other(state) => state,
        }
    }
}

impl From<String> for ProvisioningState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "Succeeded" => ProvisioningState::Succeeded,
            "Failed" => ProvisioningState::Failed,
            "Canceled" => ProvisioningState::Canceled,
            "Creating" => ProvisioningState::Creating,
            "Updating" => ProvisioningState::Updating,
            "Deleting" => ProvisioningState::Deleting,
            "InProgress" => ProvisioningState::InProgress,
            _ => ProvisioningState::Other(state),
        }
    }
}

impl From<&str> for ProvisioningState {
    fn from(state: &str) -> Self {
        ProvisioningState::from(state.to_string())
    }
}

impl From<ProvisioningState> for String {
    fn from(state: ProvisioningState) -> Self {
        match state {
            ProvisioningState::Other(state) => state,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired parameters for one cloud resource.
pub trait ResourceSpec: Send + Sync + 'static {
    /// The SDK entity for this resource kind.
    type Resource: Clone + fmt::Debug + Send + Sync + 'static;

    fn resource_name(&self) -> &str;

    fn resource_group_name(&self) -> &str;

    fn owner_resource_name(&self) -> Option<&str> {
        None
    }

    /// Compute the PUT body from the existing resource.
    ///
    /// `Ok(None)` means the existing resource already matches and no write is
    /// needed. Errors are terminal unless they are transient.
    fn parameters(
        &self,
        existing: Option<&Self::Resource>,
    ) -> Result<Option<Self::Resource>, ReconcileError>;
}

/// SDK-side handle on a long-running operation.
pub trait Poller: Send + Sync {
    /// Opaque token that lets the SDK rebuild this poller later.
    fn resume_token(&self) -> Result<String, CloudError>;

    fn is_done(&self) -> bool;

    /// Server-suggested delay before the next poll.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

/// Result of submitting a long-running operation.
#[derive(Debug)]
pub enum Lro<T, P> {
    /// Finished within the call.
    Done(T),
    /// Still running; `cause` is set when the client stopped polling because of an error.
    Pending { poller: P, cause: Option<CloudError> },
    /// Rejected without a poller.
    Failed(CloudError),
}

/// Get and create-or-update capability for one resource kind.
#[async_trait]
pub trait Creator<S: ResourceSpec>: Send + Sync {
    type Poller: Poller + 'static;

    /// Fetch the existing resource. A missing resource is a not-found [`CloudError`].
    async fn get(&self, spec: &S) -> Result<S::Resource, CloudError>;

    /// Start or resume a create-or-update, polling for at most `timeout`.
    async fn create_or_update_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        parameters: S::Resource,
        timeout: Duration,
    ) -> Lro<S::Resource, Self::Poller>;
}

/// Delete capability for one resource kind.
#[async_trait]
pub trait Deleter<S: ResourceSpec>: Send + Sync {
    type Poller: Poller + 'static;

    /// Start or resume a delete, polling for at most `timeout`.
    async fn delete_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        timeout: Duration,
    ) -> Lro<(), Self::Poller>;
}

/// Asks an upstream operator to stop reconciling a resource.
#[async_trait]
pub trait Pauser<S: ResourceSpec>: Send + Sync {
    async fn pause(&self, spec: &S) -> Result<(), CloudError>;
}

// Shared clients, so callers can keep a handle on a client they hand out.

#[async_trait]
impl<S, C> Creator<S> for Arc<C>
where
    S: ResourceSpec,
    C: Creator<S>,
{
    type Poller = C::Poller;

    async fn get(&self, spec: &S) -> Result<S::Resource, CloudError> {
        Creator::<S>::get(&**self, spec).await
    }

    async fn create_or_update_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        parameters: S::Resource,
        timeout: Duration,
    ) -> Lro<S::Resource, Self::Poller> {
        Creator::<S>::create_or_update_async(&**self, spec, resume_token, parameters, timeout).await
    }
}

#[async_trait]
impl<S, C> Deleter<S> for Arc<C>
where
    S: ResourceSpec,
    C: Deleter<S>,
{
    type Poller = C::Poller;

    async fn delete_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        timeout: Duration,
    ) -> Lro<(), Self::Poller> {
        Deleter::<S>::delete_async(&**self, spec, resume_token, timeout).await
    }
}

#[async_trait]
impl<S, C> Pauser<S> for Arc<C>
where
    S: ResourceSpec,
    C: Pauser<S>,
{
    async fn pause(&self, spec: &S) -> Result<(), CloudError> {
        Pauser::<S>::pause(&**self, spec).await
    }
}
