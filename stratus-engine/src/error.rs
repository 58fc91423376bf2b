//! Reconcile error taxonomy.
//!
//! Every error returned by the engine is one of three classes that callers
//! distinguish without string matching:
//! - *operation in progress*: a remote operation is still running
//! - *transient*: retry after a delay
//! - *terminal*: surfaced verbatim, retried with backoff

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

use crate::cloud::CloudError;
use crate::converters::ConversionError;
use crate::future::{Future, FutureKind};
use crate::mutators::MutationError;
use crate::services::images::ImageError;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors returned by reconcile operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A long-running operation was submitted and has not finished.
    #[error("operation type {} on {} resource {}/{} is not done", .future.kind, .future.service_name, .future.resource_group, .future.name)]
    OperationNotDone {
        future: Future,
        requeue_after: Duration,
    },

    /// The resource exists but is not in a state that can be acted on yet.
    #[error("{kind} {name} is not ready: {message}")]
    ResourceNotReady {
        kind: String,
        name: String,
        message: String,
        requeue_after: Duration,
    },

    /// Retry after `requeue_after`.
    #[error("{source}. Object will be requeued after {requeue_after:?}")]
    Transient {
        #[source]
        source: BoxError,
        requeue_after: Duration,
    },

    #[error("{context}: {source}")]
    Cloud {
        context: String,
        #[source]
        source: CloudError,
    },

    #[error("{context}: {source}")]
    Poller {
        context: String,
        #[source]
        source: ConversionError,
    },

    /// Persisted operation state could not be used and was dropped.
    #[error("could not decode future data, resetting long-running operation state for {kind} {service_name} {name}: {source}")]
    FutureReset {
        service_name: String,
        name: String,
        kind: FutureKind,
        #[source]
        source: ConversionError,
    },

    #[error("unknown future type {0:?}")]
    UnknownFutureKind(String),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Image(#[from] ImageError),

    /// The cloud reports the resource as failed.
    #[error("{kind} {name} failed: {message}")]
    ResourceFailed {
        kind: String,
        name: String,
        message: String,
    },

    /// Adds context while keeping the inner classification.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ReconcileError>,
    },

    #[error("{0}")]
    Terminal(String),
}

impl ReconcileError {
    /// Wrap any error as transient with the given delay.
    pub fn transient<E>(source: E, requeue_after: Duration) -> Self
    where
        E: Into<BoxError>,
    {
        ReconcileError::Transient {
            source: source.into(),
            requeue_after,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        ReconcileError::Terminal(message.into())
    }

    /// Prefix the error with `context`.
    pub fn context(self, context: impl Into<String>) -> Self {
        ReconcileError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context wrappers.
    pub fn root(&self) -> &ReconcileError {
        match self {
            ReconcileError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_operation_not_done(&self) -> bool {
        matches!(self.root(), ReconcileError::OperationNotDone { .. })
    }

    /// Waiting on the cloud, not failing.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.root(),
            ReconcileError::OperationNotDone { .. } | ReconcileError::ResourceNotReady { .. }
        )
    }

    /// Carries a requeue delay.
    pub fn is_transient(&self) -> bool {
        self.requeue_after().is_some()
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self.root() {
            ReconcileError::OperationNotDone { requeue_after, .. }
            | ReconcileError::ResourceNotReady { requeue_after, .. }
            | ReconcileError::Transient { requeue_after, .. } => Some(*requeue_after),
            _ => None,
        }
    }

    /// The future carried by an operation-not-done error.
    pub fn future(&self) -> Option<&Future> {
        match self.root() {
            ReconcileError::OperationNotDone { future, .. } => Some(future),
            _ => None,
        }
    }

    /// Ordering used when folding many outcomes: terminal > in progress.
    pub fn severity(&self) -> Severity {
        if self.is_in_progress() {
            Severity::InProgress
        } else if self.is_transient() {
            Severity::Transient
        } else {
            Severity::Terminal
        }
    }
}

/// How pressing an error is, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    InProgress,
    Transient,
    Terminal,
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
