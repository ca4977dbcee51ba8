//! Error types for the telemetry crate.

use std::io;

use faultline_gateway::{ApiError, ErrorKind};
use faultline_state::{InvalidSettings, StoreError};

use crate::redact::RedactionError;

/// Errors that can occur in the recording pipeline and admin API.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Redaction(#[from] RedactionError),

    #[error(transparent)]
    InvalidSettings(#[from] InvalidSettings),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Group creation kept losing races for the same signature.
    #[error("could not settle a group for signature {signature} after {attempts} attempts")]
    GroupingExhausted { signature: String, attempts: u32 },
}

impl TelemetryError {
    /// Status kind reported to API clients.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::InvalidSettings(_) => ErrorKind::BadRequest,
            Self::NotFound(_) | Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Self::Store(StoreError::Connection(_)) => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<TelemetryError> for ApiError {
    #[track_caller]
    fn from(err: TelemetryError) -> Self {
        let kind = err.kind();
        if kind == ErrorKind::Internal {
            tracing::error!(error = %err, "telemetry request failed");
        }
        Self::from_source(kind, &err)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(TelemetryError::InvalidRequest("bad".into()), ErrorKind::BadRequest)]
    #[case(TelemetryError::NotFound("gone".into()), ErrorKind::NotFound)]
    #[case(TelemetryError::Store(StoreError::NotFound("x".into())), ErrorKind::NotFound)]
    #[case(TelemetryError::Store(StoreError::Conflict("x".into())), ErrorKind::Conflict)]
    #[case(TelemetryError::Store(StoreError::Backend("x".into())), ErrorKind::Internal)]
    #[case(TelemetryError::Config("x".into()), ErrorKind::Internal)]
    fn maps_to_api_kind(#[case] err: TelemetryError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
        assert_eq!(ApiError::from(err).kind(), kind);
    }

    #[test]
    fn api_error_keeps_message_and_type() {
        let err = ApiError::from(TelemetryError::NotFound("Error group abc not found".into()));
        assert_eq!(err.message(), "Error group abc not found");
        assert!(err.error_type().ends_with("TelemetryError"));
    }
}
