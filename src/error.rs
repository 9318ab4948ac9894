//! Client-facing error taxonomy for the storage request pipeline.

use thiserror::Error;

/// Classifies a [`StorageClientError`] the way the retry policy and callers need to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Signature mismatch or invalid credential.
    AuthFailed,
    /// Malformed caller input.
    InvalidInput,
    /// `locationMode` conflicts with a request's `requestLocationMode`.
    LocationConstraintViolation,
    /// The current location has no configured host.
    MissingHostForLocation,
    /// A signing input could not be canonicalized.
    CanonicalizationError,
    /// The account key was not valid base64.
    InvalidKey,
    /// The targeted resource does not exist.
    ResourceNotFound,
    /// The targeted resource already exists.
    ResourceAlreadyExists,
    /// An `If-*` / lease precondition was not satisfied.
    ConditionNotMet,
    /// The service asked the caller to slow down.
    Throttled,
    /// The service reported it is busy (503).
    ServerBusy,
    /// The transport timed out waiting for a response.
    Timeout,
    /// A transport-level failure (connect, reset, DNS, ...).
    NetworkError,
    /// The operation's deadline elapsed.
    DeadlineExceeded,
    /// The service reported an internal error (500).
    InternalError,
    /// The response could not be attributed to a known failure kind.
    UnknownService,
}

/// A normalized error surfaced to the caller of a pipeline operation.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct StorageClientError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub request_id: Option<String>,
    /// The service's own error code from the response envelope (§4.4), when one
    /// was present — distinct from `kind`, which is this crate's coarser taxonomy.
    pub service_code: Option<String>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl StorageClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            request_id: None,
            service_code: None,
            cause: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_service_code(mut self, service_code: impl Into<String>) -> Self {
        self.service_code = Some(service_code.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Maps an HTTP status code to the default [`ErrorKind`] absent a parsed error envelope.
    pub fn kind_for_status(status: u16) -> ErrorKind {
        match status {
            401 | 403 => ErrorKind::AuthFailed,
            404 => ErrorKind::ResourceNotFound,
            409 => ErrorKind::ResourceAlreadyExists,
            412 => ErrorKind::ConditionNotMet,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::Throttled,
            500 => ErrorKind::InternalError,
            503 => ErrorKind::ServerBusy,
            s if (400..500).contains(&s) => ErrorKind::InvalidInput,
            s if (500..600).contains(&s) => ErrorKind::InternalError,
            _ => ErrorKind::UnknownService,
        }
    }
}

/// Result alias used throughout the pipeline.
pub type StorageClientResult<T> = Result<T, StorageClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(StorageClientError::kind_for_status(404), ErrorKind::ResourceNotFound);
        assert_eq!(StorageClientError::kind_for_status(503), ErrorKind::ServerBusy);
        assert_eq!(StorageClientError::kind_for_status(412), ErrorKind::ConditionNotMet);
    }

    #[test]
    fn service_code_round_trips_through_builder() {
        let err = StorageClientError::new(ErrorKind::ResourceNotFound, "not found").with_service_code("BlobNotFound");
        assert_eq!(err.service_code.as_deref(), Some("BlobNotFound"));
    }
}
