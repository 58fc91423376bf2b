//! Translation between SDK pollers and persisted futures.
//!
//! The resume token is an arbitrary string owned by the SDK, while the status
//! document that stores futures is YAML/JSON. Tokens are therefore stored
//! base64 encoded with the URL-safe alphabet.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use thiserror::Error;

use crate::cloud::{CloudError, Poller};
use crate::future::{Future, FutureKind};

/// Errors converting between pollers and futures.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to get resume token: {0}")]
    ResumeToken(#[source] CloudError),

    #[error("resume token is empty")]
    EmptyToken,

    #[error("failed to decode future data: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("future data is not a valid resume token: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("unknown future type {0:?}")]
    UnknownKind(String),
}

/// Package a poller's resume token as a future.
pub fn poller_to_future<P: Poller + ?Sized>(
    poller: &P,
    kind: FutureKind,
    service_name: &str,
    name: &str,
    resource_group: &str,
) -> Result<Future, ConversionError> {
    let token = poller.resume_token().map_err(ConversionError::ResumeToken)?;
    if token.is_empty() {
        return Err(ConversionError::EmptyToken);
    }

    Ok(Future {
        kind,
        service_name: service_name.to_string(),
        name: name.to_string(),
        resource_group: resource_group.to_string(),
        data: URL_SAFE.encode(token.as_bytes()),
    })
}

/// Recover the resume token stored in a future.
pub fn future_to_resume_token(future: &Future) -> Result<String, ConversionError> {
    if let FutureKind::Unknown(kind) = &future.kind {
        return Err(ConversionError::UnknownKind(kind.clone()));
    }

    let bytes = URL_SAFE.decode(future.data.as_bytes())?;
    let token = String::from_utf8(bytes)?;
    if token.is_empty() {
        return Err(ConversionError::EmptyToken);
    }
    Ok(token)
}
